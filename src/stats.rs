//! Mount-wide counters and the bounded request history.
//!
//! The HTTP statistics endpoint itself lives outside this crate; what is kept
//! here is everything it would serve: FUSE operation counts, transfer totals
//! across the connection pools, and a ring of the most recent request lines.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cache::CacheStats;

#[derive(Default)]
pub struct Stats {
    pub fuse_reads: AtomicU64,
    pub fuse_writes: AtomicU64,
    pub fuse_readdirs: AtomicU64,
    pub fuse_lookups: AtomicU64,

    pub http_jobs: AtomicU64,
    pub http_errors: AtomicU64,
    pub http_connects: AtomicU64,
    pub bytes_out: AtomicU64,
    pub bytes_in: AtomicU64,

    history: Mutex<VecDeque<String>>,
    history_size: usize,
}

impl Stats {
    pub fn new(history_size: usize) -> Self {
        Self {
            history_size,
            ..Default::default()
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Appends one request line, dropping the oldest past the configured
    /// history size.
    pub fn add_history(&self, line: String) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap();
        if history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(line);
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// JSON snapshot for the statistics surface.
    pub fn snapshot(&self, cache: &CacheStats) -> serde_json::Value {
        json!({
            "fuse": {
                "reads": self.fuse_reads.load(Ordering::Relaxed),
                "writes": self.fuse_writes.load(Ordering::Relaxed),
                "readdirs": self.fuse_readdirs.load(Ordering::Relaxed),
                "lookups": self.fuse_lookups.load(Ordering::Relaxed),
            },
            "http": {
                "jobs": self.http_jobs.load(Ordering::Relaxed),
                "errors": self.http_errors.load(Ordering::Relaxed),
                "connects": self.http_connects.load(Ordering::Relaxed),
                "bytes_out": self.bytes_out.load(Ordering::Relaxed),
                "bytes_in": self.bytes_in.load(Ordering::Relaxed),
            },
            "cache": {
                "entries": cache.entries,
                "size": cache.total_size,
                "hits": cache.hits,
                "misses": cache.misses,
            },
            "history": self.history(),
        })
    }
}
