use super::prelude::*;

/// FUSE `rename`: succeeds only when the remote side acknowledged every
/// step of the copy-and-delete; directories are refused.
pub fn rename(
    fs: &mut S3Filesystem,
    _req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    newparent: u64,
    newname: &OsStr,
    _flags: u32,
    reply: ReplyEmpty,
) {
    let (name, newname) = match (name.to_str(), newname.to_str()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            reply.error(ENOENT);
            return;
        }
    };

    match fs
        .runtime
        .block_on(fs.tree.rename(parent, name, newparent, newname))
    {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}
