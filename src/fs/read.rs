use super::prelude::*;

/// FUSE `lookup`: resolves `name` under `parent` from the tree, falling
/// back to a HEAD probe for objects the tree has not seen yet.
pub fn lookup(fs: &mut S3Filesystem, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
    Stats::bump(&fs.app.stats.fuse_lookups);
    let name = match name.to_str() {
        Some(n) => n,
        None => {
            reply.error(ENOENT);
            return;
        }
    };

    let result = fs.runtime.block_on(fs.tree.lookup(parent, name));
    match result {
        Ok(entry) => reply.entry(&TTL, &attr_from_entry(req, &entry), 0),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `readdir`: serves a `[offset, ..)` window of the cached directory
/// listing, refreshing it from the store when it has expired.
pub fn readdir(
    fs: &mut S3Filesystem,
    _req: &Request,
    ino: u64,
    _fh: u64,
    offset: i64,
    mut reply: ReplyDirectory,
) {
    Stats::bump(&fs.app.stats.fuse_readdirs);

    let listing = match fs.runtime.block_on(fs.tree.readdir(ino)) {
        Ok(listing) => listing,
        Err(e) => {
            reply.error(e.errno());
            return;
        }
    };

    for (i, dirent) in listing.iter().enumerate().skip(offset as usize) {
        let kind = match dirent.kind {
            EntryKind::Directory => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
        };
        if reply.add(dirent.ino, (i + 1) as i64, kind, &dirent.name) {
            // reply buffer is full; the kernel asks again from here
            break;
        }
    }
    reply.ok();
}

/// FUSE `read`: hands the request to the file's I/O context, which answers
/// from the disk cache or a ranged GET.
pub fn read(
    fs: &mut S3Filesystem,
    _req: &Request<'_>,
    ino: u64,
    _fh: u64,
    offset: i64,
    size: u32,
    _flags: i32,
    _lock_owner: Option<u64>,
    reply: ReplyData,
) {
    Stats::bump(&fs.app.stats.fuse_reads);

    let result = fs
        .runtime
        .block_on(fs.tree.file_read(ino, size as u64, offset as u64));
    match result {
        Ok(buf) => reply.data(&buf),
        Err(e) => reply.error(e.errno()),
    }
}

/// FUSE `open`: attaches a fresh I/O context to the inode. Reads and writes
/// both run through it, so every open gets one; the kernel's file handle
/// stays zero and the context lives on the entry.
pub fn open(fs: &mut S3Filesystem, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
    match fs.tree.file_open(ino) {
        Ok(()) => reply.opened(0, 0),
        Err(e) => reply.error(e.errno()),
    }
}
