use super::prelude::*;

/// FUSE `create`: allocates the entry locally with a write context marked
/// "assume new". Nothing reaches the server until the handle is flushed, so
/// even an untouched file uploads as an empty object on release.
pub fn create(
    fs: &mut S3Filesystem,
    req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    mode: u32,
    _umask: u32,
    _flags: i32,
    reply: ReplyCreate,
) {
    let name = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    match fs.tree.file_create(parent, name, mode as u16) {
        Ok(entry) => reply.created(&TTL, &attr_from_entry(req, &entry), 0, 0, 0),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `mkdir`: directories are purely local until a child object
/// materializes them remotely; the new entry is pinned so a listing sweep
/// cannot take it away.
pub fn mkdir(
    fs: &mut S3Filesystem,
    req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    _mode: u32,
    _umask: u32,
    reply: ReplyEntry,
) {
    let name = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    match fs.tree.dir_create(parent, name) {
        Ok(entry) => reply.entry(&TTL, &attr_from_entry(req, &entry), 0),
        Err(e) => reply.error(e.errno()),
    }
}
