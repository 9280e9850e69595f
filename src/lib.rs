//! bucketfs: a user-space filesystem that projects an S3-compatible bucket
//! into a local directory tree.
//!
//! The crate is split along the data path: the FUSE adapter (`fs`) turns
//! kernel requests into calls on the directory tree (`tree`), which drives
//! per-open-file transfers (`fileio`) against the object store through a
//! pool (`pool`) of signing HTTP connections (`s3`), with a disk-backed
//! block cache (`cache`) absorbing reads and short writes.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod fileio;
pub mod fs;
pub mod pool;
pub mod range;
pub mod s3;
pub mod stats;
pub mod tree;
