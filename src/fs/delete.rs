use super::prelude::*;

/// FUSE `unlink`: DELETE on the remote object, then the local entry is
/// tombstoned and its cached bytes dropped.
pub fn unlink(fs: &mut S3Filesystem, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
    let name = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    match fs.runtime.block_on(fs.tree.file_unlink(parent, name)) {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `rmdir`: enumerates the directory's prefix on the server and
/// deletes every key, one request at a time on a single connection.
pub fn rmdir(fs: &mut S3Filesystem, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
    let name = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    match fs.runtime.block_on(fs.tree.dir_remove(parent, name)) {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}
