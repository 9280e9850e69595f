use super::prelude::*;

/// FUSE `getattr`: attributes come straight out of the tree, no server
/// round-trip.
pub fn getattr(fs: &mut S3Filesystem, req: &Request, ino: u64, reply: ReplyAttr) {
    match fs.tree.getattr(ino) {
        Ok(entry) => reply.attr(&TTL, &attr_from_entry(req, &entry)),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `setattr`.
///
/// The store keeps no mutable attributes, so this reports the current ones
/// back unchanged; that is enough for the kernel's open/truncate
/// bookkeeping to proceed.
pub fn setattr(fs: &mut S3Filesystem, req: &Request<'_>, ino: u64, _mode: Option<u32>, _uid: Option<u32>, _gid: Option<u32>, _size: Option<u64>, _atime: Option<TimeOrNow>, _mtime: Option<TimeOrNow>, _ctime: Option<SystemTime>, _fh: Option<u64>, _crtime: Option<SystemTime>, _chgtime: Option<SystemTime>, _bkuptime: Option<SystemTime>, _flags: Option<u32>, reply: ReplyAttr) {
    match fs.tree.setattr(ino) {
        Ok(entry) => reply.attr(&TTL, &attr_from_entry(req, &entry)),
        Err(e) => reply.error(e.errno()),
    }
}
