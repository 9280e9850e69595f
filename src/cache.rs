//! Disk-backed block cache.
//!
//! One regular file per inode, named `cache_mng_<ino>`, inside a random
//! per-run subdirectory of the configured cache root. A `RangeSet` per entry
//! records which byte intervals of the object are present on disk; the entry
//! also carries the server ETag and version-id the bytes were fetched under,
//! which the read path compares against fresh response headers to decide
//! whether the cached bytes are still valid.
//!
//! Eviction is deliberately coarse: at most once per `EVICTION_CHECK_INTERVAL`
//! a store drops least-recently-used entries until the incoming bytes fit
//! under the configured cap.

use log::{debug, error};
use lru::LruCache;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::error::Result;
use crate::range::RangeSet;

const EVICTION_CHECK_INTERVAL: Duration = Duration::from_secs(10);

struct CacheEntry {
    available: RangeSet,
    modified: SystemTime,
    version_id: Option<String>,
    etag: Option<String>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            available: RangeSet::new(),
            modified: SystemTime::now(),
            version_id: None,
            etag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct CacheManager {
    dir: PathBuf,
    /// inode -> entry; head of the LRU order is the most recently touched.
    entries: LruCache<u64, CacheEntry>,
    /// Sum of range lengths over all entries.
    size: u64,
    max_size: u64,
    last_check: SystemTime,
    hits: u64,
    misses: u64,
}

impl CacheManager {
    pub fn new(config: &Config) -> Result<Self> {
        let rnd: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        let dir = Path::new(&config.filesystem.cache_dir).join(rnd);

        // a stale directory with the same name would corrupt size accounting
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir)?;

        let max_size = config.max_cache_size();
        debug!("cache dir {}, max size {} bytes", dir.display(), max_size);

        Ok(Self {
            dir,
            entries: LruCache::unbounded(),
            size: 0,
            max_size,
            last_check: SystemTime::now(),
            hits: 0,
            misses: 0,
        })
    }

    fn file_path(&self, ino: u64) -> PathBuf {
        self.dir.join(format!("cache_mng_{}", ino))
    }

    /// Returns `size` bytes at `offset` for `ino` if the entry covers that
    /// range. A hit promotes the entry to the head of the LRU order.
    pub fn retrieve(&mut self, ino: u64, size: u64, offset: u64) -> Option<Vec<u8>> {
        let covered = self
            .entries
            .peek(&ino)
            .map(|e| e.available.contains(offset, offset + size))
            .unwrap_or(false);
        if !covered {
            debug!(
                "[ino {}] no cached range [{}:{}]",
                ino,
                offset,
                offset + size
            );
            self.misses += 1;
            return None;
        }

        match self.read_slice(ino, size, offset) {
            Ok(buf) => {
                self.hits += 1;
                self.entries.get(&ino); // move to the LRU head
                Some(buf)
            }
            Err(e) => {
                // entry is left intact; a later store can re-populate it
                error!("[ino {}] cache read failed: {}", ino, e);
                self.misses += 1;
                None
            }
        }
    }

    fn read_slice(&self, ino: u64, size: u64, offset: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.file_path(ino))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `buf` at `offset` into the backing file for `ino` and extends
    /// the entry's available range. Returns false when the physical write
    /// fails; the entry is then left untouched.
    pub fn store(&mut self, ino: u64, buf: &[u8], offset: u64) -> bool {
        self.maybe_evict(buf.len() as u64);

        if let Err(e) = self.write_slice(ino, buf, offset) {
            error!("[ino {}] cache write failed: {}", ino, e);
            return false;
        }

        if self.entries.get(&ino).is_none() {
            self.entries.push(ino, CacheEntry::new());
        }
        let entry = self.entries.get_mut(&ino).expect("entry just inserted");
        let old_length = entry.available.length();
        entry.available.add(offset, offset + buf.len() as u64);
        let new_length = entry.available.length();
        debug_assert!(new_length >= old_length);
        self.size += new_length - old_length;
        entry.modified = SystemTime::now();

        debug!("[ino {}] stored [{}:{}]", ino, offset, buf.len());
        true
    }

    fn write_slice(&self, ino: u64, buf: &[u8], offset: u64) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.file_path(ino))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// At most once per check interval, drop LRU tails until `incoming` more
    /// bytes fit under the cap.
    fn maybe_evict(&mut self, incoming: u64) {
        let now = SystemTime::now();
        let due = now
            .duration_since(self.last_check)
            .map(|d| d >= EVICTION_CHECK_INTERVAL)
            .unwrap_or(false);
        if !due {
            return;
        }
        while self.max_size < self.size + incoming {
            let ino = match self.entries.peek_lru() {
                Some((&ino, _)) => ino,
                None => break,
            };
            self.remove(ino);
        }
        self.last_check = now;
    }

    /// Drops the entry and its backing file.
    pub fn remove(&mut self, ino: u64) {
        match self.entries.pop(&ino) {
            Some(entry) => {
                self.size -= entry.available.length();
                if let Err(e) = fs::remove_file(self.file_path(ino)) {
                    debug!("[ino {}] cache unlink: {}", ino, e);
                }
                debug!("[ino {}] cache entry removed", ino);
            }
            None => debug!("[ino {}] cache entry not found", ino),
        }
    }

    pub fn get_etag(&mut self, ino: u64) -> Option<String> {
        self.entries.peek(&ino).and_then(|e| e.etag.clone())
    }

    /// Records the ETag the cached bytes belong to. Returns false when there
    /// is no entry for `ino`.
    pub fn update_etag(&mut self, ino: u64, etag: &str) -> bool {
        match self.entries.peek_mut(&ino) {
            Some(entry) => {
                if entry.etag.as_deref() != Some(etag) {
                    entry.etag = Some(etag.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn get_version_id(&mut self, ino: u64) -> Option<String> {
        self.entries.peek(&ino).and_then(|e| e.version_id.clone())
    }

    pub fn update_version_id(&mut self, ino: u64, version_id: &str) {
        if let Some(entry) = self.entries.peek_mut(&ino) {
            if entry.version_id.as_deref() != Some(version_id) {
                entry.version_id = Some(version_id.to_string());
            }
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Snapshot for the statistics surface. The total recomputed by
    /// iteration must equal the tracked size.
    pub fn stats(&self) -> CacheStats {
        let total_size = self
            .entries
            .iter()
            .map(|(_, e)| e.available.length())
            .sum();
        CacheStats {
            entries: self.entries.len(),
            total_size,
            hits: self.hits,
            misses: self.misses,
        }
    }

    #[cfg(test)]
    fn force_eviction_check(&mut self) {
        self.last_check = SystemTime::UNIX_EPOCH;
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            error!("failed to remove cache dir {}: {}", self.dir.display(), e);
        }
    }
}
