//! In-memory directory tree.
//!
//! Every filesystem entry is a `DirEntry` owned by the inode table; a
//! directory's children map holds only basename -> inode number, so the
//! table is the single owner and lookups by inode are O(1). Inode numbers
//! come from a monotonic counter and are never reused within a mount.
//!
//! Directory listings are pulled from the store with delimiter-style
//! pagination and cached per directory for `filesystem.dir_cache_max_time`
//! seconds. A refresh is age-based: the tree's age is bumped, every row of
//! the listing re-affirms its entry with the new age, and entries left on an
//! old age (and not locally modified) are swept afterwards.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::fileio::FileIO;
use crate::s3::xml;
use crate::s3::HttpMethod;

pub const ROOT_INO: u64 = 1;

pub const FILE_DEFAULT_MODE: u16 = 0o644;
pub const DIR_DEFAULT_MODE: u16 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Attribute snapshot handed to the FUSE layer.
#[derive(Debug, Clone, Copy)]
pub struct EntryAttr {
    pub ino: u64,
    pub kind: EntryKind,
    pub mode: u16,
    pub size: u64,
    pub ctime: SystemTime,
}

/// One row of a cached directory listing ("." and ".." included).
#[derive(Debug, Clone)]
pub struct CachedDirent {
    pub ino: u64,
    pub kind: EntryKind,
    pub name: String,
}

struct DirListingCache {
    entries: Vec<CachedDirent>,
    created: SystemTime,
}

pub struct DirEntry {
    pub ino: u64,
    pub parent: u64,
    pub basename: String,
    /// Slash-joined path from the root, without a leading slash; "" for the
    /// root itself.
    pub fullpath: String,
    pub kind: EntryKind,
    pub mode: u16,
    pub size: u64,
    pub ctime: SystemTime,
    /// Listing generation that last re-affirmed this entry.
    pub age: u64,
    /// Locally dirty; hidden from the staleness sweep.
    pub is_modified: bool,
    /// Tombstone; unreachable through the parent once set.
    pub removed: bool,
    /// An attribute refresh is in flight.
    pub is_updating: bool,
    children: Option<HashMap<String, u64>>,
    dir_cache: Option<DirListingCache>,
    pub fop: Option<FileIO>,
}

impl DirEntry {
    fn attr(&self) -> EntryAttr {
        EntryAttr {
            ino: self.ino,
            kind: self.kind,
            mode: self.mode,
            size: self.size,
            ctime: self.ctime,
        }
    }
}

pub struct DirTree {
    app: Arc<AppContext>,
    inodes: HashMap<u64, DirEntry>,
    next_ino: u64,
    current_age: u64,
}

impl DirTree {
    pub fn new(app: Arc<AppContext>) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INO,
            DirEntry {
                ino: ROOT_INO,
                parent: 0,
                basename: "/".to_string(),
                fullpath: String::new(),
                kind: EntryKind::Directory,
                mode: DIR_DEFAULT_MODE,
                size: 0,
                ctime: SystemTime::now(),
                age: 0,
                is_modified: false,
                removed: false,
                is_updating: false,
                children: Some(HashMap::new()),
                dir_cache: None,
                fop: None,
            },
        );
        Self {
            app,
            inodes,
            next_ino: ROOT_INO + 1,
            current_age: 0,
        }
    }

    // ---------- bookkeeping ----------

    fn dir_children(&self, ino: u64) -> Result<&HashMap<String, u64>> {
        let entry = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
        entry
            .children
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("inode {} is not a directory", ino)))
    }

    /// Creates a new entry under `parent`. An existing child with the same
    /// name and kind is replaced (its subtree dropped); a kind clash fails.
    fn add_entry(
        &mut self,
        parent: u64,
        basename: &str,
        kind: EntryKind,
        mode: u16,
        size: u64,
        ctime: SystemTime,
    ) -> Result<u64> {
        let existing = self.dir_children(parent)?.get(basename).copied();
        if let Some(existing) = existing {
            let clash = self
                .inodes
                .get(&existing)
                .map(|e| e.kind != kind)
                .unwrap_or(false);
            if clash {
                return Err(Error::LocalIo(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("'{}' exists with a different kind", basename),
                )));
            }
            self.forget_child(parent, basename);
        }
        let parent_full = self.inodes[&parent].fullpath.clone();

        let fullpath = if parent == ROOT_INO {
            basename.to_string()
        } else {
            format!("{}/{}", parent_full, basename)
        };
        let ino = self.next_ino;
        self.next_ino += 1;

        debug!(
            "new entry '{}', inode {}, fullpath '{}'",
            basename, ino, fullpath
        );
        self.inodes.insert(
            ino,
            DirEntry {
                ino,
                parent,
                basename: basename.to_string(),
                fullpath,
                kind,
                mode,
                size,
                ctime,
                age: self.current_age,
                is_modified: false,
                removed: false,
                is_updating: false,
                children: if kind == EntryKind::Directory {
                    Some(HashMap::new())
                } else {
                    None
                },
                dir_cache: None,
                fop: None,
            },
        );
        if let Some(children) = self
            .inodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
        {
            children.insert(basename.to_string(), ino);
        }
        self.invalidate_dir_cache(parent);
        Ok(ino)
    }

    /// Drops `ino` and everything below it from the inode table. The caller
    /// removes the name from the parent's children map.
    fn drop_subtree(&mut self, ino: u64) {
        if let Some(entry) = self.inodes.remove(&ino) {
            if let Some(children) = entry.children {
                for (_, child) in children {
                    self.drop_subtree(child);
                }
            }
        }
    }

    /// Unhooks `name` from `parent` and drops its subtree.
    fn forget_child(&mut self, parent: u64, name: &str) {
        let child = self
            .inodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
            .and_then(|c| c.remove(name));
        if let Some(child) = child {
            self.drop_subtree(child);
        }
        self.invalidate_dir_cache(parent);
    }

    fn invalidate_dir_cache(&mut self, ino: u64) {
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.dir_cache = None;
        }
    }

    /// Starts a listing refresh: every entry re-affirmed from now on gets
    /// the new age.
    fn start_update(&mut self) {
        self.current_age += 1;
    }

    /// Idempotent upsert from one listing row: an existing child is
    /// re-affirmed with the current age and new size, a missing one is
    /// created.
    fn update_entry(
        &mut self,
        parent: u64,
        name: &str,
        kind: EntryKind,
        size: u64,
        last_modified: SystemTime,
    ) -> Result<u64> {
        let existing = self.dir_children(parent)?.get(name).copied();
        match existing {
            Some(ino) => {
                let age = self.current_age;
                if let Some(entry) = self.inodes.get_mut(&ino) {
                    entry.age = entry.age.max(age);
                    entry.size = size;
                }
                Ok(ino)
            }
            None => {
                let mode = match kind {
                    EntryKind::File => FILE_DEFAULT_MODE,
                    EntryKind::Directory => DIR_DEFAULT_MODE,
                };
                self.add_entry(parent, name, kind, mode, size, last_modified)
            }
        }
    }

    /// Sweeps children of `parent` whose age predates the current listing
    /// and that are not locally modified.
    fn stop_update(&mut self, parent: u64) {
        let stale: Vec<String> = match self.inodes.get(&parent).and_then(|p| p.children.as_ref()) {
            Some(children) => children
                .iter()
                .filter(|(_, &ino)| {
                    self.inodes
                        .get(&ino)
                        .map(|e| e.age < self.current_age && !e.is_modified)
                        .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect(),
            None => return,
        };
        for name in stale {
            debug!("sweeping stale entry '{}'", name);
            self.forget_child(parent, &name);
        }
    }

    /// Refreshes a locally-modified entry's size with a HEAD request,
    /// serialized by the `is_updating` flag. Failures leave the local
    /// attributes in place.
    async fn refresh_entry_size(&mut self, ino: u64) {
        let fullpath = match self.inodes.get_mut(&ino) {
            Some(entry) => {
                entry.is_updating = true;
                entry.fullpath.clone()
            }
            None => return,
        };

        let result = async {
            let app = Arc::clone(&self.app);
            let mut conn = app.ops_pool.acquire().await?;
            conn.make_request(&format!("/{}", fullpath), HttpMethod::Head, None)
                .await
        }
        .await;

        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.is_updating = false;
            if let Ok(response) = result {
                if let Some(size) = response
                    .header("Content-Length")
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    entry.size = size;
                }
            }
        }
    }

    /// Marks an entry as confirmed to exist remotely; keeps the sweep away
    /// from it for the current generation.
    pub fn set_entry_exist(&mut self, ino: u64) {
        let age = self.current_age;
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.age = entry.age.max(age);
            entry.is_updating = false;
        }
    }

    pub fn get_stats(&self) -> (usize, u64) {
        (self.inodes.len(), self.current_age)
    }

    // ---------- attribute operations ----------

    pub fn getattr(&self, ino: u64) -> Result<EntryAttr> {
        self.inodes
            .get(&ino)
            .map(|e| e.attr())
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    /// Attributes are immutable on the remote side; setattr just reports the
    /// current ones back so kernel bookkeeping can proceed.
    pub fn setattr(&self, ino: u64) -> Result<EntryAttr> {
        self.getattr(ino)
    }

    // ---------- lookup ----------

    /// Finds `name` under `parent`. A child unknown locally is probed with a
    /// HEAD request and materialized as a regular file when the object
    /// exists.
    pub async fn lookup(&mut self, parent: u64, name: &str) -> Result<EntryAttr> {
        let child = self.dir_children(parent)?.get(name).copied();
        if let Some(ino) = child {
            let (attr, removed, refresh) = {
                let entry = self
                    .inodes
                    .get(&ino)
                    .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
                (
                    entry.attr(),
                    entry.removed,
                    entry.is_modified
                        && !entry.is_updating
                        && entry.kind == EntryKind::Directory,
                )
            };
            if removed {
                return Err(Error::NotFound(name.to_string()));
            }
            if refresh {
                self.refresh_entry_size(ino).await;
                return self.getattr(ino);
            }
            return Ok(attr);
        }

        debug!("'{}' not in tree, probing the server", name);
        let parent_full = self.inodes[&parent].fullpath.clone();
        let fullpath = if parent == ROOT_INO {
            name.to_string()
        } else {
            format!("{}/{}", parent_full, name)
        };

        let response = {
            let app = Arc::clone(&self.app);
            let mut conn = app.ops_pool.acquire().await?;
            conn.make_request(&format!("/{}", fullpath), HttpMethod::Head, None)
                .await?
        };

        let size = response
            .header("Content-Length")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(0);
        let ctime = response
            .header("Last-Modified")
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| {
                std::time::UNIX_EPOCH
                    + std::time::Duration::from_secs(dt.timestamp().max(0) as u64)
            })
            .unwrap_or_else(SystemTime::now);

        let ino = self.update_entry(parent, name, EntryKind::File, size, ctime)?;
        self.getattr(ino)
    }

    // ---------- readdir ----------

    /// Returns the full listing of `ino` ("." and ".." first), from the
    /// per-directory cache when it is fresh enough, otherwise from a
    /// paginated listing of the remote prefix followed by the staleness
    /// sweep.
    pub async fn readdir(&mut self, ino: u64) -> Result<Vec<CachedDirent>> {
        let entry = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
        if entry.kind != EntryKind::Directory {
            return Err(Error::NotFound(format!("inode {} is not a directory", ino)));
        }

        let max_age = std::time::Duration::from_secs(self.app.config.filesystem.dir_cache_max_time);
        if let Some(cache) = &entry.dir_cache {
            if cache.created.elapsed().map(|e| e <= max_age).unwrap_or(false) {
                debug!("serving listing of inode {} from cache", ino);
                return Ok(cache.entries.clone());
            }
        }
        self.invalidate_dir_cache(ino);

        self.refresh_listing(ino).await?;

        let listing = self.build_listing(ino)?;
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.dir_cache = Some(DirListingCache {
                entries: listing.clone(),
                created: SystemTime::now(),
            });
        }
        Ok(listing)
    }

    /// Pulls every page of the remote listing for `ino` and upserts the
    /// rows, then sweeps entries the listing no longer mentions.
    async fn refresh_listing(&mut self, ino: u64) -> Result<()> {
        let fullpath = self.inodes[&ino].fullpath.clone();
        let prefix = if fullpath.is_empty() {
            String::new()
        } else {
            format!("{}/", fullpath)
        };
        let keys_per_request = self.app.config.s3.keys_per_request;

        self.start_update();

        let app = Arc::clone(&self.app);
        let mut conn = app.ops_pool.acquire().await?;
        let mut marker: Option<String> = None;
        loop {
            let mut path = format!(
                "/?delimiter=/&max-keys={}&prefix={}",
                keys_per_request, prefix
            );
            if let Some(m) = &marker {
                path.push_str(&format!("&marker={}", m));
            }
            let response = conn.make_request(&path, HttpMethod::Get, None).await?;
            let page = xml::parse_list_page(&response.body, &prefix)?;

            for file in &page.files {
                self.update_entry(ino, &file.name, EntryKind::File, file.size, file.last_modified)?;
            }
            for dir in &page.dirs {
                self.update_entry(ino, &dir.name, EntryKind::Directory, 0, SystemTime::now())?;
            }

            if !page.is_truncated {
                break;
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        drop(conn);

        self.stop_update(ino);
        Ok(())
    }

    /// Materializes the cached listing: ".", "..", then children carrying
    /// the current age.
    fn build_listing(&self, ino: u64) -> Result<Vec<CachedDirent>> {
        let entry = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
        let parent = if ino == ROOT_INO { ROOT_INO } else { entry.parent };

        let mut listing = vec![
            CachedDirent {
                ino,
                kind: EntryKind::Directory,
                name: ".".to_string(),
            },
            CachedDirent {
                ino: parent,
                kind: EntryKind::Directory,
                name: "..".to_string(),
            },
        ];
        if let Some(children) = &entry.children {
            let mut names: Vec<&String> = children.keys().collect();
            names.sort();
            for name in names {
                let child_ino = children[name];
                if let Some(child) = self.inodes.get(&child_ino) {
                    // locally modified entries are listed even when the last
                    // remote listing predates them
                    if (child.age >= self.current_age || child.is_modified) && !child.removed {
                        listing.push(CachedDirent {
                            ino: child.ino,
                            kind: child.kind,
                            name: child.basename.clone(),
                        });
                    }
                }
            }
        }
        Ok(listing)
    }

    // ---------- file lifecycle ----------

    /// Creates a regular file locally and attaches a fresh-file I/O context;
    /// nothing goes to the server until data is flushed.
    pub fn file_create(&mut self, parent: u64, name: &str, mode: u16) -> Result<EntryAttr> {
        let ino = self.add_entry(
            parent,
            name,
            EntryKind::File,
            mode,
            0,
            SystemTime::now(),
        )?;
        let entry = self.inodes.get_mut(&ino).expect("entry just created");
        entry.is_modified = true;
        entry.fop = Some(FileIO::new(&entry.fullpath, ino, true));
        Ok(entry.attr())
    }

    /// Opens an existing regular file, attaching an I/O context for the
    /// handle's lifetime.
    pub fn file_open(&mut self, ino: u64) -> Result<()> {
        let entry = self
            .inodes
            .get_mut(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?;
        entry.fop = Some(FileIO::new(&entry.fullpath, ino, false));
        Ok(())
    }

    pub async fn file_write(&mut self, ino: u64, data: &[u8], offset: u64) -> Result<usize> {
        let mut fop = self.take_fop(ino)?;
        let app = Arc::clone(&self.app);
        let result = fop.write_buffer(&app, data, offset).await;
        let written_size = fop.current_size();
        if let Some(entry) = self.inodes.get_mut(&ino) {
            if result.is_ok() {
                entry.size = written_size;
                entry.is_modified = true;
            }
            entry.fop = Some(fop);
        }
        result
    }

    pub async fn file_read(&mut self, ino: u64, size: u64, offset: u64) -> Result<Vec<u8>> {
        let mut fop = self.take_fop(ino)?;
        let app = Arc::clone(&self.app);
        let result = fop.read_buffer(&app, size, offset).await;
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.fop = Some(fop);
        }
        if result.is_ok() {
            self.set_entry_exist(ino);
        }
        result
    }

    /// Finalizes the open handle: flushes pending bytes and commits a
    /// multipart upload before the context is destroyed.
    pub async fn file_release(&mut self, ino: u64) -> Result<()> {
        let mut fop = match self.take_fop(ino) {
            Ok(fop) => fop,
            // read-only handles may already be gone; release is idempotent
            Err(_) => return Ok(()),
        };
        let app = Arc::clone(&self.app);
        let result = fop.release(&app).await;
        if result.is_ok() {
            if let Some(entry) = self.inodes.get_mut(&ino) {
                entry.is_modified = false;
            }
        }
        result
    }

    fn take_fop(&mut self, ino: u64) -> Result<FileIO> {
        self.inodes
            .get_mut(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))?
            .fop
            .take()
            .ok_or_else(|| Error::NotFound(format!("inode {} has no open file context", ino)))
    }

    // ---------- removal ----------

    /// Unlinks `name` under `parent`: DELETE on the remote object, then the
    /// local tombstone, parent listing-cache drop, and cache eviction.
    pub async fn file_unlink(&mut self, parent: u64, name: &str) -> Result<()> {
        let ino = self
            .dir_children(parent)?
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if entry.kind != EntryKind::File {
            return Err(Error::NotFound(format!("'{}' is not a file", name)));
        }
        let fullpath = entry.fullpath.clone();

        self.app.cache.lock().unwrap().remove(ino);

        {
            let app = Arc::clone(&self.app);
            let mut conn = app.ops_pool.acquire().await?;
            conn.make_request(&format!("/{}", fullpath), HttpMethod::Delete, None)
                .await?;
        }

        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.removed = true;
        }
        self.forget_child(parent, name);
        info!("unlinked '{}'", fullpath);
        Ok(())
    }

    /// Removes a directory: lists its whole prefix and deletes every
    /// returned key one at a time on a single connection; only a drained
    /// queue is a success.
    pub async fn dir_remove(&mut self, parent: u64, name: &str) -> Result<()> {
        let ino = self
            .dir_children(parent)?
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = self
            .inodes
            .get(&ino)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if entry.kind != EntryKind::Directory {
            return Err(Error::NotFound(format!("'{}' is not a directory", name)));
        }
        let prefix = format!("{}/", entry.fullpath);

        {
            let app = Arc::clone(&self.app);
            let mut conn = app.ops_pool.acquire().await?;
            let response = conn
                .make_request(&format!("/?prefix={}", prefix), HttpMethod::Get, None)
                .await?;
            // keys come back in full; delete them one by one
            let page = xml::parse_list_page(&response.body, "")?;
            for file in &page.files {
                debug!("removing '{}'", file.name);
                conn.make_request(&format!("/{}", file.name), HttpMethod::Delete, None)
                    .await?;
            }
        }

        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.removed = true;
        }
        self.forget_child(parent, name);
        info!("removed directory '{}'", prefix);
        Ok(())
    }

    // ---------- mkdir / rename ----------

    /// Creates a directory entry locally. It gets the maximum age so a
    /// listing sweep never removes it before the store learns about it.
    pub fn dir_create(&mut self, parent: u64, name: &str) -> Result<EntryAttr> {
        let ino = self.add_entry(
            parent,
            name,
            EntryKind::Directory,
            DIR_DEFAULT_MODE,
            0,
            SystemTime::now(),
        )?;
        let entry = self.inodes.get_mut(&ino).expect("entry just created");
        entry.age = u64::MAX;
        Ok(entry.attr())
    }

    /// Renames a regular file by copying it through the client (GET old,
    /// PUT new, DELETE old) and remapping the local entry. Directories are
    /// not supported.
    pub async fn rename(
        &mut self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        let ino = self
            .dir_children(parent)?
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if self.inodes[&ino].kind != EntryKind::File {
            return Err(Error::Protocol("directory rename is not supported".into()));
        }
        let old_path = self.inodes[&ino].fullpath.clone();
        let new_parent_full = {
            self.dir_children(new_parent)?;
            self.inodes[&new_parent].fullpath.clone()
        };
        let new_path = if new_parent == ROOT_INO {
            new_name.to_string()
        } else {
            format!("{}/{}", new_parent_full, new_name)
        };

        {
            let app = Arc::clone(&self.app);
            let mut conn = app.ops_pool.acquire().await?;
            let body = conn
                .make_request(&format!("/{}", old_path), HttpMethod::Get, None)
                .await?
                .body;
            conn.make_request(&format!("/{}", new_path), HttpMethod::Put, Some(body))
                .await?;
            conn.make_request(&format!("/{}", old_path), HttpMethod::Delete, None)
                .await?;
        }

        // remote acknowledged every step; remap locally
        if let Some(children) = self
            .inodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
        {
            children.remove(name);
        }
        // a stale entry under the new name is superseded
        self.forget_child(new_parent, new_name);
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.parent = new_parent;
            entry.basename = new_name.to_string();
            entry.fullpath = new_path.clone();
        }
        if let Some(children) = self
            .inodes
            .get_mut(&new_parent)
            .and_then(|p| p.children.as_mut())
        {
            children.insert(new_name.to_string(), ino);
        }
        self.invalidate_dir_cache(parent);
        self.invalidate_dir_cache(new_parent);
        info!("renamed '{}' to '{}'", old_path, new_path);
        Ok(())
    }

    #[cfg(test)]
    fn contains_ino(&self, ino: u64) -> bool {
        self.inodes.contains_key(&ino)
    }
}
