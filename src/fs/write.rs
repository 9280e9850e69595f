use super::prelude::*;

/// FUSE `write`: appends to the file's write buffer. Offsets must arrive in
/// order; the engine rejects anything non-sequential.
pub fn write(
    fs: &mut S3Filesystem,
    _req: &Request<'_>,
    ino: u64,
    _fh: u64,
    offset: i64,
    data: &[u8],
    _write_flags: u32,
    _flags: i32,
    _lock_owner: Option<u64>,
    reply: ReplyWrite,
) {
    Stats::bump(&fs.app.stats.fuse_writes);

    let result = fs
        .runtime
        .block_on(fs.tree.file_write(ino, data, offset as u64));
    match result {
        Ok(written) => reply.written(written as u32),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `release`: the final flush. Pending bytes (or a newly created empty
/// file) go up now, and an in-flight multipart upload is committed before
/// the I/O context is destroyed.
pub fn release(
    fs: &mut S3Filesystem,
    _req: &Request<'_>,
    ino: u64,
    _fh: u64,
    _flags: i32,
    _lock_owner: Option<u64>,
    _flush: bool,
    reply: ReplyEmpty,
) {
    match fs.runtime.block_on(fs.tree.file_release(ino)) {
        Ok(()) => reply.ok(),
        Err(e) => {
            log::error!("release of inode {} failed: {}", ino, e);
            reply.error(e.errno());
        }
    }
}

/// FUSE `flush`: a no-op; data durability is settled at `release`.
pub fn flush(
    _fs: &mut S3Filesystem,
    _req: &Request<'_>,
    _ino: u64,
    _fh: u64,
    _lock_owner: u64,
    reply: ReplyEmpty,
) {
    reply.ok();
}
