//! FUSE adapter.
//!
//! `S3Filesystem` owns the directory tree and a current-thread Tokio runtime;
//! each kernel request is translated into one tree call driven to completion
//! with `block_on`, and the result is shaped into the kernel reply. The
//! `Filesystem` impl below is a plain dispatcher; the per-operation logic
//! lives in the sibling modules.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use crate::app::AppContext;
use crate::tree::{DirTree, EntryAttr, EntryKind};

pub mod prelude;

mod attr;
mod create;
mod delete;
mod read;
mod rename;
mod write;
mod xattr;

/// TTL handed to the kernel for attribute and entry caches.
pub const TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u64 = 512;

pub struct S3Filesystem {
    pub(crate) runtime: tokio::runtime::Runtime,
    pub(crate) tree: DirTree,
    pub(crate) app: Arc<AppContext>,
}

impl S3Filesystem {
    pub fn new(app: Arc<AppContext>, runtime: tokio::runtime::Runtime) -> Self {
        let tree = DirTree::new(Arc::clone(&app));
        Self { runtime, tree, app }
    }
}

/// Kernel-shaped attributes for a tree entry, with ownership taken from the
/// requesting process.
pub fn attr_from_entry(req: &Request<'_>, entry: &EntryAttr) -> FileAttr {
    let kind = match entry.kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
    };
    FileAttr {
        ino: entry.ino,
        size: entry.size,
        blocks: (entry.size + BLOCK_SIZE - 1) / BLOCK_SIZE,
        atime: entry.ctime,
        mtime: entry.ctime,
        ctime: entry.ctime,
        crtime: entry.ctime,
        kind,
        perm: entry.mode,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: req.uid(),
        gid: req.gid(),
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

impl Filesystem for S3Filesystem {
    // --- attribute operations (attr.rs) ---

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        attr::getattr(self, req, ino, reply);
    }

    fn setattr(&mut self, req: &Request<'_>, ino: u64, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64>, atime: Option<fuser::TimeOrNow>, mtime: Option<fuser::TimeOrNow>, ctime: Option<std::time::SystemTime>, fh: Option<u64>, crtime: Option<std::time::SystemTime>, chgtime: Option<std::time::SystemTime>, bkuptime: Option<std::time::SystemTime>, flags: Option<u32>, reply: ReplyAttr) {
        attr::setattr(self, req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime, flags, reply);
    }

    // --- read operations (read.rs) ---

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        read::lookup(self, req, parent, name, reply);
    }

    fn readdir(&mut self, req: &Request, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        read::readdir(self, req, ino, fh, offset, reply);
    }

    fn read(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, size: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyData) {
        read::read(self, req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        read::open(self, req, ino, flags, reply);
    }

    // --- write operations (write.rs) ---

    fn write(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, data: &[u8], write_flags: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyWrite) {
        write::write(self, req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    fn release(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, lock_owner: Option<u64>, flush: bool, reply: ReplyEmpty) {
        write::release(self, req, ino, fh, flags, lock_owner, flush, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        write::flush(self, req, ino, fh, lock_owner, reply);
    }

    // --- create operations (create.rs) ---

    fn create(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, flags: i32, reply: ReplyCreate) {
        create::create(self, req, parent, name, mode, umask, flags, reply);
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        create::mkdir(self, req, parent, name, mode, umask, reply);
    }

    // --- delete operations (delete.rs) ---

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        delete::unlink(self, req, parent, name, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        delete::rmdir(self, req, parent, name, reply);
    }

    // --- rename (rename.rs) ---

    fn rename(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        rename::rename(self, req, parent, name, newparent, newname, flags, reply);
    }

    // --- extended attributes (xattr.rs) ---

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        xattr::getxattr(self, req, ino, name, size, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        xattr::listxattr(self, req, ino, size, reply);
    }

    fn setxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, value: &[u8], flags: i32, position: u32, reply: ReplyEmpty) {
        xattr::setxattr(self, req, ino, name, value, flags, position, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        xattr::removexattr(self, req, ino, name, reply);
    }

    // --- symlinks: no wire encoding exists for them ---

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        reply.error(libc::ENOSYS);
    }

    fn symlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, _link: &std::path::Path, reply: ReplyEntry) {
        reply.error(libc::ENOSYS);
    }
}
