//! Shared per-mount state: configuration, the three connection pools, the
//! disk cache, the endpoint, and counters. One instance lives for the
//! lifetime of the mount and is shared by the directory tree and every file
//! I/O operation.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::s3::{xml, Connection, Endpoint, HttpMethod};
use crate::stats::Stats;

pub struct AppContext {
    pub config: Arc<Config>,
    pub endpoint: Arc<Mutex<Endpoint>>,
    pub read_pool: Arc<ConnectionPool<Connection>>,
    pub write_pool: Arc<ConnectionPool<Connection>>,
    pub ops_pool: Arc<ConnectionPool<Connection>>,
    pub cache: Mutex<CacheManager>,
    pub stats: Arc<Stats>,
    /// Set from the startup probe; bucket versioning state.
    pub versioning: AtomicBool,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let stats = Arc::new(Stats::new(config.statistics.history_size));
        let endpoint = Arc::new(Mutex::new(Endpoint::from_config(&config)));
        let cache = Mutex::new(CacheManager::new(&config)?);

        let build_pool = |name: &'static str, count: usize| -> Result<Arc<ConnectionPool<Connection>>> {
            let connections = (0..count)
                .map(|i| {
                    Connection::new(i, Arc::clone(&config), Arc::clone(&endpoint), Arc::clone(&stats))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ConnectionPool::from_connections(
                name,
                config.pool.max_requests_per_pool,
                connections,
            ))
        };

        let read_pool = build_pool("readers", config.pool.readers)?;
        let write_pool = build_pool("writers", config.pool.writers)?;
        let ops_pool = build_pool("operations", config.pool.operations)?;
        info!(
            "connection pools: {} readers, {} writers, {} operations",
            config.pool.readers, config.pool.writers, config.pool.operations
        );

        let versioning = AtomicBool::new(config.s3.versioning);
        Ok(Arc::new(Self {
            config,
            endpoint,
            read_pool,
            write_pool,
            ops_pool,
            cache,
            stats,
            versioning,
        }))
    }

    /// Startup probe against the bucket: fetches the versioning state and,
    /// more importantly, proves the endpoint and credentials work before the
    /// filesystem mounts. Transport errors here are fatal for the process.
    pub async fn check_bucket(&self) -> Result<()> {
        let mut conn = self.ops_pool.acquire().await?;
        let response = conn
            .make_request("/?versioning", HttpMethod::Get, None)
            .await?;
        let enabled = matches!(
            xml::parse_versioning_status(&response.body).as_deref(),
            Some("Enabled")
        );
        debug!(
            "bucket probe done (versioning: {}, probe connection jobs: {}, errors: {})",
            enabled,
            conn.jobs(),
            conn.errors()
        );
        self.versioning.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn cache_enabled(&self) -> bool {
        self.config.filesystem.cache_enabled
    }
}
