//! Crate-wide error type.
//!
//! Every fallible operation in the mount returns `Result<T, Error>`. The
//! variants mirror the failure classes the filesystem actually distinguishes:
//! transport problems are retried by reconnecting, `NotFound` becomes `ENOENT`
//! at the FUSE boundary, everything else surfaces as `EIO`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Connect failure, timeout, or EOF mid-response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected HTTP status, malformed XML, or a missing required header.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected our signature or ACL during startup.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// 404 from lookup, HEAD, or GET.
    #[error("not found: {0}")]
    NotFound(String),

    /// ETag changed under us; recovered by dropping the cache and re-reading.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Cache file or mount directory I/O failure.
    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// The pool's wait queue is at `pool.max_requests_per_pool`.
    #[error("connection pool wait queue is full")]
    PoolExhausted,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Errno this error maps to when replied to the kernel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            _ => libc::EIO,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Transport(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Error::Protocol(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}
