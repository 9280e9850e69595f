//! End-to-end scenarios against an in-process object store: the real
//! request engine, signing, pools, disk cache and directory tree, with only
//! the remote side mocked.

mod common;

use common::{MockResponse, MockStore, Recorded};
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use bucketfs::app::AppContext;
use bucketfs::error::Error;
use bucketfs::tree::{DirTree, EntryKind, ROOT_INO};

const EMPTY_LIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <IsTruncated>false</IsTruncated>
</ListBucketResult>"#;

fn list_page(keys: &[(&str, u64)], truncated: bool, next_marker: Option<&str>) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult>"#);
    body.push_str(&format!("<IsTruncated>{}</IsTruncated>", truncated));
    if let Some(marker) = next_marker {
        body.push_str(&format!("<NextMarker>{}</NextMarker>", marker));
    }
    for (key, size) in keys {
        body.push_str(&format!(
            "<Contents><Key>{}</Key><Size>{}</Size>\
             <LastModified>2024-01-01T00:00:00.000Z</LastModified></Contents>",
            key, size
        ));
    }
    body.push_str("</ListBucketResult>");
    body
}

async fn setup(handler: common::Handler) -> (MockStore, Arc<AppContext>, DirTree, TempDir) {
    let store = MockStore::start(handler).await;
    let tmp = TempDir::new().unwrap();
    let app = AppContext::new(common::test_config(store.port, tmp.path())).unwrap();
    let tree = DirTree::new(Arc::clone(&app));
    (store, app, tree, tmp)
}

#[tokio::test]
async fn readdir_of_empty_bucket_lists_dot_entries_only() {
    let handler: common::Handler = Arc::new(|req: &Recorded| {
        assert_eq!(req.method, "GET");
        MockResponse::ok(EMPTY_LIST.as_bytes())
    });
    let (store, _app, mut tree, _tmp) = setup(handler).await;

    let listing = tree.readdir(ROOT_INO).await.unwrap();
    let names: Vec<&str> = listing.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec![".", ".."]);

    let requests = store.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].path.contains("delimiter=/"));
    assert!(requests[0].path.contains("max-keys=1000"));
    assert!(requests[0]
        .header("Authorization")
        .unwrap()
        .starts_with("AWS AKID:"));
    assert!(requests[0].header("Date").is_some());
    assert_eq!(requests[0].header("Accept-Encoding"), Some("identity"));
}

#[tokio::test]
async fn small_file_goes_up_as_one_put_and_reads_back() {
    let handler: common::Handler = Arc::new(|req: &Recorded| {
        match (req.method.as_str(), req.path.as_str()) {
            ("PUT", "/hello.txt") => MockResponse::ok(b""),
            ("HEAD", "/hello.txt") => MockResponse::status(200)
                .with_header("Content-Length", "5")
                .with_header("ETag", "\"abc\""),
            _ => MockResponse::status(500),
        }
    });
    let (store, _app, mut tree, _tmp) = setup(handler).await;

    let attr = tree.file_create(ROOT_INO, "hello.txt", 0o644).unwrap();
    tree.file_write(attr.ino, b"hello", 0).await.unwrap();
    tree.file_release(attr.ino).await.unwrap();

    // exactly one PUT of the whole object; multipart was never initiated
    let requests = store.requests();
    assert!(requests.iter().all(|r| !r.path.contains("uploads")));
    let puts: Vec<&Recorded> = requests.iter().filter(|r| r.method == "PUT").collect();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].path, "/hello.txt");
    assert_eq!(puts[0].body, b"hello");
    assert_eq!(
        puts[0].header("Content-MD5"),
        Some("XUFAKrxLKna5cZ2REBfFkg==")
    );
    assert_eq!(puts[0].header("x-amz-storage-class"), Some("STANDARD"));
    assert!(puts[0].header("x-amz-meta-date").is_some());

    // read back: HEAD confirms size and tag, the bytes come from the cache
    tree.file_open(attr.ino).unwrap();
    let data = tree.file_read(attr.ino, 5, 0).await.unwrap();
    assert_eq!(data, b"hello");
    let requests = store.requests();
    assert!(requests.iter().any(|r| r.method == "HEAD"));
    assert!(
        requests.iter().all(|r| r.method != "GET" || r.path.starts_with("/?")),
        "object bytes must come from the local cache"
    );
}

#[tokio::test]
async fn large_file_uses_the_multipart_protocol() {
    let handler: common::Handler = Arc::new(|req: &Recorded| {
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/big.bin?uploads") => MockResponse::ok(
                b"<InitiateMultipartUploadResult>\
                  <UploadId>uid-1</UploadId>\
                  </InitiateMultipartUploadResult>",
            ),
            ("POST", "/big.bin?uploadId=uid-1") => MockResponse::ok(b""),
            ("PUT", path) if path.starts_with("/big.bin?partNumber=") => MockResponse::ok(b""),
            _ => MockResponse::status(500),
        }
    });
    let store = MockStore::start(handler).await;
    let tmp = TempDir::new().unwrap();
    let mut config = common::test_config(store.port, tmp.path());
    config.s3.part_size = 1024;
    let app = AppContext::new(config).unwrap();
    let mut tree = DirTree::new(Arc::clone(&app));

    let chunks = [vec![b'a'; 1024], vec![b'b'; 1024], vec![b'c'; 1024]];
    let attr = tree.file_create(ROOT_INO, "big.bin", 0o644).unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        tree.file_write(attr.ino, chunk, (i * 1024) as u64)
            .await
            .unwrap();
    }
    tree.file_release(attr.ino).await.unwrap();

    let requests = store.requests();
    let sequence: Vec<(&str, &str)> = requests
        .iter()
        .map(|r| (r.method.as_str(), r.path.as_str()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            ("POST", "/big.bin?uploads"),
            ("PUT", "/big.bin?partNumber=1&uploadId=uid-1"),
            ("PUT", "/big.bin?partNumber=2&uploadId=uid-1"),
            ("PUT", "/big.bin?partNumber=3&uploadId=uid-1"),
            ("POST", "/big.bin?uploadId=uid-1"),
        ]
    );

    // the initiation carries the storage class
    assert_eq!(requests[0].header("x-amz-storage-class"), Some("STANDARD"));

    // each part PUT carries the base64 MD5 of its bytes
    for (i, chunk) in chunks.iter().enumerate() {
        let digest = Md5::digest(chunk);
        assert_eq!(requests[i + 1].body, *chunk);
        assert_eq!(
            requests[i + 1].header("Content-MD5"),
            Some(base64::encode(&digest).as_str())
        );
    }

    // the completion lists the parts in order with their quoted hex MD5s
    let expected: String = {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (i, chunk) in chunks.iter().enumerate() {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                i + 1,
                hex::encode(Md5::digest(chunk))
            ));
        }
        body.push_str("</CompleteMultipartUpload>");
        body
    };
    assert_eq!(String::from_utf8_lossy(&requests[4].body), expected);
}

#[tokio::test]
async fn ranged_read_fetches_a_part_sized_chunk_and_caches_it() {
    let handler: common::Handler = Arc::new(|req: &Recorded| {
        match (req.method.as_str(), req.path.as_str()) {
            ("HEAD", "/blob") => MockResponse::status(200)
                .with_header("Content-Length", "5000")
                .with_header("ETag", "\"tag\""),
            ("GET", "/blob") => {
                assert_eq!(req.header("Range"), Some("bytes=1000-3000"));
                MockResponse::ok(&vec![b'x'; 2000]).with_header("ETag", "\"tag\"")
            }
            _ => MockResponse::status(500),
        }
    });
    let store = MockStore::start(handler).await;
    let tmp = TempDir::new().unwrap();
    let mut config = common::test_config(store.port, tmp.path());
    config.s3.part_size = 2000;
    let app = AppContext::new(config).unwrap();
    let mut tree = DirTree::new(Arc::clone(&app));

    // learn about the object, then read 1000 bytes at offset 1000
    let attr = tree.lookup(ROOT_INO, "blob").await.unwrap();
    tree.file_open(attr.ino).unwrap();
    let data = tree.file_read(attr.ino, 1000, 1000).await.unwrap();
    assert_eq!(data.len(), 1000);
    assert!(data.iter().all(|&b| b == b'x'));

    // the whole fetched chunk landed in the cache at the request offset
    let gets_before = store
        .requests()
        .iter()
        .filter(|r| r.method == "GET")
        .count();
    let data = tree.file_read(attr.ino, 1000, 2000).await.unwrap();
    assert_eq!(data.len(), 1000);
    let gets_after = store
        .requests()
        .iter()
        .filter(|r| r.method == "GET")
        .count();
    assert_eq!(gets_before, gets_after, "second read must hit the cache");
}

#[tokio::test]
async fn etag_change_invalidates_cached_bytes() {
    let handler: common::Handler = Arc::new(|req: &Recorded| {
        match (req.method.as_str(), req.path.as_str()) {
            ("HEAD", "/obj.bin") => MockResponse::status(200)
                .with_header("Content-Length", "9")
                .with_header("ETag", "\"abc\""),
            ("GET", "/obj.bin") => MockResponse::ok(b"new-bytes").with_header("ETag", "\"abc\""),
            _ => MockResponse::status(500),
        }
    });
    let (store, app, mut tree, _tmp) = setup(handler).await;

    // the tree learns about the object through a lookup probe
    let attr = tree.lookup(ROOT_INO, "obj.bin").await.unwrap();
    assert_eq!(attr.size, 9);
    assert_eq!(attr.kind, EntryKind::File);

    // cached bytes from an older version of the object
    {
        let mut cache = app.cache.lock().unwrap();
        assert!(cache.store(attr.ino, b"old-bytes", 0));
        assert!(cache.update_etag(attr.ino, "\"def\""));
    }

    tree.file_open(attr.ino).unwrap();
    let data = tree.file_read(attr.ino, 9, 0).await.unwrap();
    assert_eq!(data, b"new-bytes", "stale cache must not be served");

    // the entry was rebuilt under the server's tag
    assert_eq!(
        app.cache.lock().unwrap().get_etag(attr.ino).as_deref(),
        Some("\"abc\"")
    );
    let requests = store.requests();
    assert!(requests.iter().any(|r| r.method == "GET"));
}

#[tokio::test]
async fn listing_paginates_and_sweeps_stale_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler: common::Handler = {
        let calls = Arc::clone(&calls);
        Arc::new(move |req: &Recorded| {
            if req.method == "HEAD" {
                // lookup probe for an already-swept entry
                return MockResponse::status(404);
            }
            assert_eq!(req.method, "GET");
            if req.path.contains("marker=m1") {
                return MockResponse::ok(list_page(&[("b.txt", 2)], false, None).as_bytes());
            }
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                MockResponse::ok(list_page(&[("old.txt", 1)], false, None).as_bytes())
            } else {
                MockResponse::ok(list_page(&[("a.txt", 1)], true, Some("m1")).as_bytes())
            }
        })
    };
    let store = MockStore::start(handler).await;
    let tmp = TempDir::new().unwrap();
    let mut config = common::test_config(store.port, tmp.path());
    // disable the listing cache so the second readdir refreshes
    config.filesystem.dir_cache_max_time = 0;
    let app = AppContext::new(config).unwrap();
    let mut tree = DirTree::new(Arc::clone(&app));

    let listing = tree.readdir(ROOT_INO).await.unwrap();
    let names: Vec<&str> = listing.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "old.txt"]);

    let listing = tree.readdir(ROOT_INO).await.unwrap();
    let names: Vec<&str> = listing.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "a.txt", "b.txt"]);

    // the follow-up page was requested with the marker
    assert!(store
        .requests()
        .iter()
        .any(|r| r.path.contains("marker=m1")));

    // the swept entry is gone: a fresh lookup reaches the server and 404s
    match tree.lookup(ROOT_INO, "old.txt").await {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn lookup_probes_the_server_and_unlink_deletes() {
    let deleted = Arc::new(AtomicBool::new(false));
    let handler: common::Handler = {
        let deleted = Arc::clone(&deleted);
        Arc::new(move |req: &Recorded| match req.method.as_str() {
            "HEAD" if deleted.load(Ordering::SeqCst) => MockResponse::status(404),
            "HEAD" => MockResponse::status(200)
                .with_header("Content-Length", "7")
                .with_header("Last-Modified", "Tue, 27 Mar 2007 19:36:42 GMT"),
            "DELETE" => {
                deleted.store(true, Ordering::SeqCst);
                MockResponse::status(204)
            }
            _ => MockResponse::status(500),
        })
    };
    let (store, _app, mut tree, _tmp) = setup(handler).await;

    let attr = tree.lookup(ROOT_INO, "ghost.txt").await.unwrap();
    assert_eq!(attr.size, 7);

    tree.file_unlink(ROOT_INO, "ghost.txt").await.unwrap();
    assert!(store
        .requests()
        .iter()
        .any(|r| r.method == "DELETE" && r.path == "/ghost.txt"));

    let err = tree.lookup(ROOT_INO, "ghost.txt").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}
