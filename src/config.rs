//! Typed configuration, loaded from a TOML file.
//!
//! Sections map one-to-one to the dotted key namespace used throughout the
//! code (`pool.writers`, `s3.part_size`, ...). Every field has a default, so
//! a missing or partial file still produces a usable `Config`. The
//! `AWSACCESSKEYID` / `AWSSECRETACCESSKEY` environment variables override the
//! configured credentials, and a handful of CLI flags override file values
//! (see `main.rs`).

use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppSection {
    /// Do not daemonize the process.
    pub foreground: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self { foreground: false }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogSection {
    pub use_syslog: bool,
    pub use_color: bool,
    /// Default log filter when RUST_LOG is not set ("error".."trace").
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            use_syslog: false,
            use_color: true,
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PoolSection {
    pub writers: usize,
    pub readers: usize,
    pub operations: usize,
    /// Cap on queued waiters per pool; an acquire beyond this fails.
    pub max_requests_per_pool: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            writers: 2,
            readers: 2,
            operations: 4,
            max_requests_per_pool: 100,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct S3Section {
    /// Prefix request URIs with "/<bucket>" instead of putting the bucket in
    /// the host name.
    pub path_style: bool,
    /// max-keys per listing page.
    pub keys_per_request: u32,
    /// Write-buffer threshold that switches an upload to multipart; also the
    /// chunk size for ranged GETs.
    pub part_size: u64,
    pub check_empty_files: bool,
    /// Value of the x-amz-storage-class header on uploads.
    pub storage_type: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub versioning: bool,
}

impl Default for S3Section {
    fn default() -> Self {
        Self {
            path_style: false,
            keys_per_request: 1000,
            part_size: 5 * 1024 * 1024,
            check_empty_files: false,
            storage_type: "STANDARD".to_string(),
            host: "s3.amazonaws.com".to_string(),
            port: 80,
            ssl: false,
            bucket_name: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            versioning: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConnectionSection {
    /// Per-request timeout, seconds.
    pub timeout: u64,
    pub retries: u32,
    pub max_retries: u32,
    /// Bound on the 301 redirect loop of a single logical request.
    pub max_redirects: u32,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            timeout: 20,
            retries: 2,
            max_retries: 2,
            max_redirects: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FilesystemSection {
    /// Seconds a cached directory listing stays valid.
    pub dir_cache_max_time: u64,
    pub md5_enabled: bool,
    pub cache_enabled: bool,
    pub cache_dir: String,
    /// Cache size cap in bytes; used when the megabyte key is absent.
    pub cache_dir_max_size: u64,
    /// Preferred cache size cap, in MiB.
    pub cache_dir_max_megabyte_size: Option<u64>,
    pub cache_object_ttl: u64,
}

impl Default for FilesystemSection {
    fn default() -> Self {
        Self {
            dir_cache_max_time: 5,
            md5_enabled: true,
            cache_enabled: true,
            cache_dir: "/tmp/bucketfs".to_string(),
            cache_dir_max_size: 1024 * 1024 * 1024,
            cache_dir_max_megabyte_size: None,
            cache_object_ttl: 600,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StatisticsSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub stats_path: String,
    /// Number of request-history lines retained.
    pub history_size: usize,
    pub access_key: String,
}

impl Default for StatisticsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8090,
            stats_path: "/stats".to_string(),
            history_size: 100,
            access_key: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppSection,
    pub log: LogSection,
    pub pool: PoolSection,
    pub s3: S3Section,
    pub connection: ConnectionSection,
    pub filesystem: FilesystemSection,
    pub statistics: StatisticsSection,
}

impl Config {
    /// Loads configuration from `path`.
    ///
    /// When `explicit` is false (the default search path), a missing or
    /// unparsable file falls back to defaults with a warning. An explicitly
    /// requested file that cannot be read or parsed is a startup error.
    pub fn load(path: &Path, explicit: bool) -> Result<Config> {
        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            warn!("{} not found, using default configuration", path.display());
            return Ok(Config::default());
        }

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if explicit {
                    return Err(Error::Config(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    )));
                }
                warn!("failed to read {}: {}, using defaults", path.display(), e);
                return Ok(Config::default());
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                if explicit {
                    Err(Error::Config(format!(
                        "failed to parse {}: {}",
                        path.display(),
                        e
                    )))
                } else {
                    warn!("failed to parse {}: {}, using defaults", path.display(), e);
                    Ok(Config::default())
                }
            }
        }
    }

    /// AWSACCESSKEYID / AWSSECRETACCESSKEY override the file values if set.
    pub fn apply_env_credentials(&mut self) {
        if let Ok(key) = std::env::var("AWSACCESSKEYID") {
            if !key.is_empty() {
                self.s3.access_key_id = key;
            }
        }
        if let Ok(secret) = std::env::var("AWSSECRETACCESSKEY") {
            if !secret.is_empty() {
                self.s3.secret_access_key = secret;
            }
        }
    }

    /// Maximum cache size in bytes. The MiB-denominated key wins when both
    /// are configured.
    pub fn max_cache_size(&self) -> u64 {
        match self.filesystem.cache_dir_max_megabyte_size {
            Some(mb) => mb * 1024 * 1024,
            None => self.filesystem.cache_dir_max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.pool.writers, 2);
        assert_eq!(config.s3.part_size, 5 * 1024 * 1024);
        assert_eq!(config.connection.max_redirects, 5);
        assert!(config.filesystem.cache_enabled);
    }

    #[test]
    fn parses_partial_file() {
        let content = r#"
            [s3]
            bucket_name = "photos"
            host = "storage.example.com"
            port = 443
            ssl = true
            path_style = true

            [pool]
            readers = 8
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.s3.bucket_name, "photos");
        assert_eq!(config.s3.port, 443);
        assert!(config.s3.ssl);
        assert!(config.s3.path_style);
        assert_eq!(config.pool.readers, 8);
        // untouched sections keep their defaults
        assert_eq!(config.pool.writers, 2);
        assert_eq!(config.filesystem.dir_cache_max_time, 5);
    }

    #[test]
    fn megabyte_cache_size_preferred() {
        let mut config = Config::default();
        config.filesystem.cache_dir_max_size = 999;
        assert_eq!(config.max_cache_size(), 999);
        config.filesystem.cache_dir_max_megabyte_size = Some(2);
        assert_eq!(config.max_cache_size(), 2 * 1024 * 1024);
    }

    #[test]
    fn missing_default_path_falls_back() {
        let config = Config::load(Path::new("/nonexistent/bucketfs.toml"), false).unwrap();
        assert_eq!(config.s3.keys_per_request, 1000);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/bucketfs.toml"), true).is_err());
    }
}
