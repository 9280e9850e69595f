//! Per-open-file I/O engine.
//!
//! One `FileIO` exists per open file handle and drives both directions of
//! transfer:
//!
//! * **Writes** must be sequential: each write's offset has to equal the
//!   bytes accepted so far. Data accumulates in the write buffer (mirrored
//!   into the disk cache) until it reaches `s3.part_size`, at which point the
//!   upload switches to the multipart protocol: initiate once, PUT numbered
//!   parts as the buffer refills, and commit the part list on release. Small
//!   files never initiate multipart and go up as one PUT on release.
//! * **Reads** send a HEAD on first use to learn the remote size and ETag,
//!   then serve every request from the disk cache, filling it with ranged
//!   GETs of at least `s3.part_size` bytes. An ETag change observed on any
//!   response invalidates the cached bytes for this inode.

use bytes::{Bytes, BytesMut};
use log::{debug, error};
use md5::{Digest, Md5};
use std::io;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::s3::xml::{self, UploadPart};
use crate::s3::HttpMethod;

/// Hard protocol limit on multipart part numbers.
const MAX_PART_NUMBER: u32 = 10_000;

pub struct FileIO {
    /// Remote name, with the leading '/'.
    fname: String,
    ino: u64,
    /// File was just created and never flushed; upload it on release even if
    /// nothing was written.
    assume_new: bool,

    // write state
    current_size: u64,
    write_buf: BytesMut,
    multipart_initiated: bool,
    upload_id: Option<String>,
    part_number: u32,
    parts: Vec<UploadPart>,
    /// Digest over every byte written through this handle.
    md5: Md5,

    // read state
    head_sent: bool,
    file_size: u64,
}

impl FileIO {
    pub fn new(fullpath: &str, ino: u64, assume_new: bool) -> Self {
        Self {
            fname: format!("/{}", fullpath),
            ino,
            assume_new,
            current_size: 0,
            write_buf: BytesMut::new(),
            multipart_initiated: false,
            upload_id: None,
            part_number: 0,
            parts: Vec::new(),
            md5: Md5::new(),
            head_sent: false,
            file_size: 0,
        }
    }

    /// Bytes accepted through this handle so far.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    // ---------- write path ----------

    /// Accepts the next write. The offset must equal the bytes accepted so
    /// far; anything else is rejected.
    pub async fn write_buffer(
        &mut self,
        app: &AppContext,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize> {
        if offset != self.current_size {
            error!(
                "[ino {}] non-sequential write at offset {} (expected {})",
                self.ino, offset, self.current_size
            );
            return Err(Error::LocalIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only sequential writes are supported",
            )));
        }

        self.write_buf.extend_from_slice(buf);
        self.current_size += buf.len() as u64;
        if !buf.is_empty() {
            // written-to files flush on buffer content alone; the empty-file
            // upload path is only for handles that never saw bytes
            self.assume_new = false;
        }
        debug!(
            "[ino {}] buffered {} bytes, write buffer now {}",
            self.ino,
            buf.len(),
            self.write_buf.len()
        );

        // mirror into the local cache so an immediate read-back hits
        if app.cache_enabled() {
            app.cache.lock().unwrap().store(self.ino, buf, offset);
        }

        if (self.write_buf.len() as u64) >= app.config.s3.part_size {
            if !self.multipart_initiated {
                self.init_multipart(app).await?;
            }
            self.flush_part(app, false).await?;
        }
        Ok(buf.len())
    }

    /// POST `<name>?uploads` and remember the upload id.
    async fn init_multipart(&mut self, app: &AppContext) -> Result<()> {
        let mut conn = app.write_pool.acquire().await?;
        conn.add_output_header("x-amz-storage-class", &app.config.s3.storage_type);
        let path = format!("{}?uploads", self.fname);
        self.multipart_initiated = true;
        let response = conn.make_request(&path, HttpMethod::Post, None).await?;
        let upload_id = xml::parse_upload_id(&response.body)?;
        debug!("[ino {}] multipart initiated, id {}", self.ino, upload_id);
        self.upload_id = Some(upload_id);
        self.part_number = 1;
        Ok(())
    }

    /// Uploads the whole write buffer: as the next numbered part when the
    /// upload is multipart, otherwise as the single PUT of the entire
    /// object (`final_flush` from release).
    async fn flush_part(&mut self, app: &AppContext, final_flush: bool) -> Result<()> {
        let body = Bytes::copy_from_slice(&self.write_buf);
        let (md5_hex, md5_base64) = digest_pair(&body);
        self.md5.update(&body);

        let path;
        if self.multipart_initiated {
            let upload_id = self.upload_id.as_ref().ok_or_else(|| {
                Error::Protocol("upload id is not set, aborting upload".into())
            })?;
            if self.part_number > MAX_PART_NUMBER {
                return Err(Error::Protocol(format!(
                    "part number {} exceeds the protocol limit",
                    self.part_number
                )));
            }
            path = format!(
                "{}?partNumber={}&uploadId={}",
                self.fname, self.part_number, upload_id
            );
            self.parts.push(UploadPart {
                number: self.part_number,
                md5_hex,
                md5_base64: md5_base64.clone(),
            });
            self.part_number += 1;
        } else {
            debug_assert!(final_flush);
            path = self.fname.clone();
            self.parts.push(UploadPart {
                number: 1,
                md5_hex,
                md5_base64: md5_base64.clone(),
            });
        }

        let mut conn = app.write_pool.acquire().await?;
        conn.add_output_header("Content-MD5", &md5_base64);
        if final_flush && !self.multipart_initiated {
            conn.add_output_header("x-amz-storage-class", &app.config.s3.storage_type);
            let now = chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();
            conn.add_output_header("x-amz-meta-date", &now);
        }

        debug!(
            "[ino {}] sending {} bytes to {}",
            self.ino,
            body.len(),
            path
        );
        conn.make_request(&path, HttpMethod::Put, Some(body)).await?;
        self.write_buf.clear();
        Ok(())
    }

    /// POST the part list to commit the multipart upload.
    async fn complete_multipart(&mut self, app: &AppContext) -> Result<()> {
        let upload_id = self
            .upload_id
            .as_ref()
            .ok_or_else(|| Error::Protocol("upload id is not set, aborting upload".into()))?;
        let path = format!("{}?uploadId={}", self.fname, upload_id);
        let body = Bytes::from(xml::build_complete_multipart(&self.parts));

        let mut conn = app.write_pool.acquire().await?;
        conn.make_request(&path, HttpMethod::Post, Some(body)).await?;
        debug!(
            "[ino {}] multipart upload of {} parts committed",
            self.ino,
            self.parts.len()
        );
        Ok(())
    }

    /// Finishes the upload when the file is closed. Pending bytes (or a
    /// created-but-never-written file) are flushed first; a multipart upload
    /// is then committed.
    pub async fn release(&mut self, app: &AppContext) -> Result<()> {
        if !self.write_buf.is_empty() || self.assume_new {
            self.flush_part(app, true).await?;
            self.assume_new = false;
            if self.multipart_initiated {
                self.complete_multipart(app).await?;
            }
        } else if self.multipart_initiated {
            self.complete_multipart(app).await?;
        }
        if app.config.filesystem.md5_enabled && !self.parts.is_empty() {
            let digest = self.md5.clone().finalize();
            debug!("[ino {}] uploaded, md5 {}", self.ino, hex::encode(digest));
        }
        Ok(())
    }

    // ---------- read path ----------

    /// Serves a read of `size` bytes at `offset`, from the cache when the
    /// range is present, otherwise by fetching at least a part-size chunk
    /// from the server.
    pub async fn read_buffer(&mut self, app: &AppContext, size: u64, offset: u64) -> Result<Vec<u8>> {
        if !self.head_sent {
            self.send_head(app).await?;
        }

        if offset >= self.file_size {
            debug!(
                "[ino {}] read at {} beyond remote size {}",
                self.ino, offset, self.file_size
            );
            return Ok(Vec::new());
        }
        let mut size = size;
        if offset + size > self.file_size {
            size = self.file_size - offset;
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        if app.cache_enabled() {
            if let Some(buf) = app.cache.lock().unwrap().retrieve(self.ino, size, offset) {
                debug!("[ino {}] read [{}:{}] from cache", self.ino, offset, size);
                return Ok(buf);
            }
        }

        let (body, request_offset, etag) = self.fetch_range(app, size, offset).await?;

        if app.cache_enabled() {
            let mut cache = app.cache.lock().unwrap();
            cache.store(self.ino, &body, request_offset);
            // a freshly created entry adopts the tag the bytes came under
            if cache.get_etag(self.ino).is_none() {
                cache.update_etag(self.ino, &etag);
            }
            if let Some(buf) = cache.retrieve(self.ino, size, offset) {
                return Ok(buf);
            }
        }

        // cache disabled or the store failed; slice the response directly
        let start = (offset - request_offset) as usize;
        let end = (start + size as usize).min(body.len());
        if start >= body.len() {
            return Err(Error::Protocol(format!(
                "short response for {}: wanted offset {} of {} bytes",
                self.fname,
                offset,
                body.len()
            )));
        }
        Ok(body[start..end].to_vec())
    }

    /// HEAD the object: learns the remote size and checks the ETag against
    /// the cached one.
    async fn send_head(&mut self, app: &AppContext) -> Result<()> {
        let mut conn = app.read_pool.acquire().await?;
        let response = conn.make_request(&self.fname, HttpMethod::Head, None).await?;

        self.head_sent = true;
        self.file_size = response
            .header("Content-Length")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(0);
        debug!("[ino {}] remote size {}", self.ino, self.file_size);

        self.reconcile_etag(app, &response)?;
        Ok(())
    }

    /// GET a chunk that covers `[offset, offset+size)`. Small objects are
    /// fetched whole without a Range header; otherwise the request asks for
    /// `max(part_size, size)` bytes starting at `offset`.
    async fn fetch_range(
        &mut self,
        app: &AppContext,
        size: u64,
        offset: u64,
    ) -> Result<(Bytes, u64, String)> {
        let mut conn = app.read_pool.acquire().await?;
        let range = range_request(self.file_size, app.config.s3.part_size, size, offset);
        let request_offset = match &range {
            Some((request_offset, header)) => {
                conn.add_output_header("Range", header);
                *request_offset
            }
            None => 0,
        };

        let response = conn.make_request(&self.fname, HttpMethod::Get, None).await?;
        let etag = self.reconcile_etag(app, &response)?;

        debug!(
            "[ino {}] fetched {} bytes at {}",
            self.ino,
            response.body.len(),
            request_offset
        );
        Ok((response.body, request_offset, etag))
    }

    /// Compares the response ETag with the one the cache was filled under.
    /// Same tag: cached bytes stay valid. Different: the whole entry is
    /// invalid and dropped. No cached tag yet: adopt the server's. Returns
    /// the tag the server reported.
    fn reconcile_etag(&self, app: &AppContext, response: &crate::s3::S3Response) -> Result<String> {
        let etag = response
            .header("ETag")
            .ok_or_else(|| Error::Protocol("response carries no ETag".into()))?
            .to_string();

        let mut cache = app.cache.lock().unwrap();
        match cache.get_etag(self.ino) {
            Some(cached) if cached == etag => {
                debug!("[ino {}] etag unchanged, cache kept", self.ino);
            }
            Some(cached) => {
                debug!(
                    "[ino {}] etag changed ({} -> {}), invalidating cache",
                    self.ino, cached, etag
                );
                cache.remove(self.ino);
            }
            None => {
                cache.update_etag(self.ino, &etag);
            }
        }

        if app.versioning.load(std::sync::atomic::Ordering::Relaxed) {
            if let Some(version_id) = response.header("x-amz-version-id") {
                cache.update_version_id(self.ino, version_id);
            }
        }
        Ok(etag)
    }

    #[cfg(test)]
    fn set_remote_size(&mut self, size: u64) {
        self.head_sent = true;
        self.file_size = size;
    }
}

/// Hex and base64 MD5 of one buffer.
fn digest_pair(buf: &[u8]) -> (String, String) {
    let digest = Md5::digest(buf);
    (hex::encode(&digest), base64::encode(&digest))
}

/// Decides the Range header for a chunk fetch. `None` means the object is
/// smaller than a part and is fetched whole from offset 0. The chunk grows
/// to the request size when a single read wants more than one part.
fn range_request(
    file_size: u64,
    part_size: u64,
    size: u64,
    offset: u64,
) -> Option<(u64, String)> {
    if file_size < part_size {
        return None;
    }
    let chunk = part_size.max(size);
    Some((offset, format!("bytes={}-{}", offset, offset + chunk)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_app() -> (Arc<AppContext>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.filesystem.cache_dir = tmp.path().to_str().unwrap().to_string();
        (AppContext::new(config).unwrap(), tmp)
    }

    #[tokio::test]
    async fn sequential_writes_buffer_locally() {
        let (app, _tmp) = test_app();
        let mut fop = FileIO::new("dir/file.bin", 42, true);
        assert_eq!(fop.write_buffer(&app, b"hello ", 0).await.unwrap(), 6);
        assert_eq!(fop.write_buffer(&app, b"world", 6).await.unwrap(), 5);
        assert_eq!(fop.current_size(), 11);
        // mirrored into the cache
        let buf = app.cache.lock().unwrap().retrieve(42, 11, 0).unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn non_sequential_write_is_rejected() {
        let (app, _tmp) = test_app();
        let mut fop = FileIO::new("f", 1, true);
        fop.write_buffer(&app, b"abc", 0).await.unwrap();
        let err = fop.write_buffer(&app, b"xyz", 10).await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(fop.current_size(), 3, "rejected write changes nothing");
    }

    #[tokio::test]
    async fn read_beyond_remote_size_returns_empty() {
        let (app, _tmp) = test_app();
        let mut fop = FileIO::new("f", 1, false);
        fop.set_remote_size(100);
        let buf = fop.read_buffer(&app, 10, 100).await.unwrap();
        assert!(buf.is_empty());
        let buf = fop.read_buffer(&app, 10, 5000).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn read_is_clamped_and_served_from_cache() {
        let (app, _tmp) = test_app();
        app.cache.lock().unwrap().store(7, b"0123456789", 0);
        let mut fop = FileIO::new("f", 7, false);
        fop.set_remote_size(10);
        // wants 20 bytes at offset 4, clamped to the remaining 6
        let buf = fop.read_buffer(&app, 20, 4).await.unwrap();
        assert_eq!(buf, b"456789");
    }

    #[test]
    fn digest_pair_known_vector() {
        let (hex, b64) = digest_pair(b"hello");
        assert_eq!(hex, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(b64, "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn range_header_for_large_objects() {
        // 5 MiB object, 2 MiB parts, 4 MiB read at 1 MiB
        let mib = 1024 * 1024;
        let (offset, header) = range_request(5 * mib, 2 * mib, 4 * mib, mib).unwrap();
        assert_eq!(offset, mib);
        assert_eq!(header, "bytes=1048576-5242880");
        // small read still fetches a whole part
        let (_, header) = range_request(5 * mib, 2 * mib, 4096, 0).unwrap();
        assert_eq!(header, format!("bytes=0-{}", 2 * mib));
    }

    #[test]
    fn small_objects_are_fetched_whole() {
        assert!(range_request(1000, 5 * 1024 * 1024, 100, 50).is_none());
    }
}
