//! Shared imports for the `fs` handler modules.
//!
//! Every per-operation file pulls the same FUSE reply types, errno
//! constants, and internal state types; collecting them here keeps the
//! handlers down to their actual logic.

// --- FUSE types ---
pub use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

// --- libc error codes ---
pub use libc::{EIO, ENOENT, ENOSYS};
#[cfg(not(target_os = "macos"))]
pub use libc::ENODATA;
#[cfg(target_os = "macos")]
pub use libc::ENOATTR;

// --- std ---
pub use std::ffi::OsStr;
pub use std::time::SystemTime;

// --- internal ---
pub use super::{attr_from_entry, S3Filesystem, TTL};
pub use crate::stats::Stats;
pub use crate::tree::{EntryKind, ROOT_INO};
