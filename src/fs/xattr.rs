use super::prelude::*;

/// FUSE `getxattr`: objects carry no extended attributes, so every name is
/// answered with "no such attribute".
pub fn getxattr(
    _fs: &mut S3Filesystem,
    _req: &Request,
    _ino: u64,
    _name: &OsStr,
    _size: u32,
    reply: ReplyXattr,
) {
    #[cfg(target_os = "macos")]
    reply.error(ENOATTR);

    #[cfg(not(target_os = "macos"))]
    reply.error(ENODATA);
}

/// FUSE `listxattr`: always an empty list. A `size == 0` call is the kernel
/// asking how many bytes the list needs.
pub fn listxattr(_fs: &mut S3Filesystem, _req: &Request, _ino: u64, size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(0);
    } else {
        reply.data(&[]);
    }
}

/// FUSE `setxattr`: accepted and discarded. Refusing it makes desktop file
/// managers fail whole copies over metadata they can live without.
pub fn setxattr(
    _fs: &mut S3Filesystem,
    _req: &Request,
    _ino: u64,
    _name: &OsStr,
    _value: &[u8],
    _flags: i32,
    _position: u32,
    reply: ReplyEmpty,
) {
    reply.ok();
}

/// FUSE `removexattr`: nothing is stored, so removal always "succeeds".
pub fn removexattr(
    _fs: &mut S3Filesystem,
    _req: &Request,
    _ino: u64,
    _name: &OsStr,
    reply: ReplyEmpty,
) {
    reply.ok();
}
