//! S3 XML bodies: list-bucket pages, multipart initiation, redirect errors,
//! bucket versioning, and the complete-multipart request body.

use chrono::NaiveDateTime;
use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// One `<Contents>` row of a listing page, already stripped to a basename
/// relative to the requested prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedFile {
    pub name: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// One `<CommonPrefixes>` row, stripped to a basename without the trailing
/// slash.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedDir {
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub files: Vec<ListedFile>,
    pub dirs: Vec<ListedDir>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Part record of an in-flight multipart upload.
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// 1-based part number.
    pub number: u32,
    /// Hex MD5 of the part, quoted into the completion body as its ETag.
    pub md5_hex: String,
    /// Base64 MD5 of the part, sent as Content-MD5 on the part PUT.
    pub md5_base64: String,
}

/// Returns the text of the first element named `wanted` (local name, so a
/// namespace prefix does not matter).
fn first_element_text(body: &[u8], wanted: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => inside = e.local_name().as_ref() == wanted,
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// `UploadId` from an initiate-multipart-upload response.
pub fn parse_upload_id(body: &[u8]) -> Result<String> {
    first_element_text(body, b"UploadId")
        .ok_or_else(|| Error::Protocol("multipart init response has no UploadId".into()))
}

/// `//Error/Endpoint` from a 301 body, when the Location header is absent.
pub fn parse_redirect_endpoint(body: &[u8]) -> Option<String> {
    first_element_text(body, b"Endpoint")
}

/// `Status` from a bucket-versioning response ("Enabled" / "Suspended").
pub fn parse_versioning_status(body: &[u8]) -> Option<String> {
    first_element_text(body, b"Status")
}

/// Parses "2013-04-11T15:16:09.000Z"-style timestamps, ignoring the
/// sub-second tail.
fn parse_last_modified(text: &str) -> SystemTime {
    let trimmed = if text.len() > 19 { &text[..19] } else { text };
    match NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        Ok(dt) => UNIX_EPOCH + Duration::from_secs(dt.and_utc().timestamp().max(0) as u64),
        Err(_) => SystemTime::now(),
    }
}

/// Parses one page of `GET /?delimiter=/&prefix=<p>...` output.
///
/// `dir_prefix` is the listed prefix ("" for the root, "photos/2024/"
/// otherwise); keys are reduced to basenames relative to it. The placeholder
/// row whose key equals the prefix itself is skipped, as is a bare "/".
pub fn parse_list_page(body: &[u8], dir_prefix: &str) -> Result<ListPage> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut page = ListPage::default();

    // where we are: inside Contents / CommonPrefixes, and which leaf field
    let mut in_contents = false;
    let mut in_prefixes = false;
    let mut field: Option<Vec<u8>> = None;

    let mut key = String::new();
    let mut size: u64 = 0;
    let mut last_modified = SystemTime::now();
    let mut prefix = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Contents" => {
                    in_contents = true;
                    key.clear();
                    size = 0;
                    last_modified = SystemTime::now();
                }
                b"CommonPrefixes" => {
                    in_prefixes = true;
                    prefix.clear();
                }
                name => field = Some(name.to_vec()),
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::Protocol(format!("bad listing XML: {}", e)))?
                    .into_owned();
                match field.as_deref() {
                    Some(b"Key") if in_contents => key = text,
                    Some(b"Size") if in_contents => size = text.parse().unwrap_or(0),
                    Some(b"LastModified") if in_contents => {
                        last_modified = parse_last_modified(&text)
                    }
                    Some(b"Prefix") if in_prefixes => prefix = text,
                    Some(b"IsTruncated") => page.is_truncated = text == "true",
                    Some(b"NextMarker") => page.next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Contents" => {
                    in_contents = false;
                    if let Some(name) = basename_of(&key, dir_prefix) {
                        page.files.push(ListedFile {
                            name,
                            size,
                            last_modified,
                        });
                    }
                }
                b"CommonPrefixes" => {
                    in_prefixes = false;
                    if let Some(name) = basename_of(prefix.trim_end_matches('/'), dir_prefix) {
                        page.dirs.push(ListedDir { name });
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Protocol(format!("bad listing XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    debug!(
        "listing page for '{}': {} files, {} dirs, truncated: {}",
        dir_prefix,
        page.files.len(),
        page.dirs.len(),
        page.is_truncated
    );
    Ok(page)
}

/// Strips `dir_prefix` off `key`; None for the prefix placeholder itself and
/// for degenerate "/" names.
fn basename_of(key: &str, dir_prefix: &str) -> Option<String> {
    if key.is_empty() || key == dir_prefix {
        return None;
    }
    let base = key.strip_prefix(dir_prefix)?;
    if base.is_empty() || base == "/" {
        return None;
    }
    Some(base.to_string())
}

/// Body of the complete-multipart-upload POST, parts in part-number order.
pub fn build_complete_multipart(parts: &[UploadPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            part.number, part.md5_hex
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_id() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>example-bucket</Bucket>
  <Key>example-object</Key>
  <UploadId>VXBsb2FkIElEIGZvciBlbHZpbmcncyBtb3ZpZS5tMnRz</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(
            parse_upload_id(body).unwrap(),
            "VXBsb2FkIElEIGZvciBlbHZpbmcncyBtb3ZpZS5tMnRz"
        );
    }

    #[test]
    fn upload_id_missing_is_protocol_error() {
        assert!(parse_upload_id(b"<InitiateMultipartUploadResult/>").is_err());
    }

    #[test]
    fn redirect_endpoint() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>PermanentRedirect</Code>
  <Endpoint>bucket.s3-eu-west-1.amazonaws.com</Endpoint>
</Error>"#;
        assert_eq!(
            parse_redirect_endpoint(body).as_deref(),
            Some("bucket.s3-eu-west-1.amazonaws.com")
        );
        assert!(parse_redirect_endpoint(b"<Error><Code>x</Code></Error>").is_none());
    }

    #[test]
    fn versioning_status() {
        let body = br#"<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Status>Enabled</Status>
</VersioningConfiguration>"#;
        assert_eq!(parse_versioning_status(body).as_deref(), Some("Enabled"));
    }

    #[test]
    fn list_page_with_files_and_prefixes() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>photos/</Prefix>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>photos/</Key>
    <LastModified>2013-04-11T15:16:09.000Z</LastModified>
    <Size>0</Size>
  </Contents>
  <Contents>
    <Key>photos/cat.jpg</Key>
    <LastModified>2013-04-11T15:16:09.000Z</LastModified>
    <Size>12345</Size>
  </Contents>
  <CommonPrefixes>
    <Prefix>photos/2024/</Prefix>
  </CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_page(body, "photos/").unwrap();
        assert_eq!(page.files.len(), 1, "placeholder key is skipped");
        assert_eq!(page.files[0].name, "cat.jpg");
        assert_eq!(page.files[0].size, 12345);
        assert_eq!(page.dirs, vec![ListedDir { name: "2024".into() }]);
        assert!(!page.is_truncated);
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn list_page_truncated_with_marker() {
        let body = br#"<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextMarker>photos/m1</NextMarker>
  <Contents><Key>photos/a</Key><Size>1</Size><LastModified>2020-01-01T00:00:00.000Z</LastModified></Contents>
</ListBucketResult>"#;
        let page = parse_list_page(body, "photos/").unwrap();
        assert!(page.is_truncated);
        assert_eq!(page.next_marker.as_deref(), Some("photos/m1"));
        assert_eq!(page.files[0].name, "a");
    }

    #[test]
    fn list_page_root_prefix() {
        let body = br#"<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>hello.txt</Key><Size>5</Size><LastModified>2020-01-01T00:00:00.000Z</LastModified></Contents>
  <CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_page(body, "").unwrap();
        assert_eq!(page.files[0].name, "hello.txt");
        assert_eq!(page.dirs[0].name, "dir");
    }

    #[test]
    fn complete_multipart_body_in_order() {
        let parts = vec![
            UploadPart {
                number: 1,
                md5_hex: "aaa".into(),
                md5_base64: String::new(),
            },
            UploadPart {
                number: 2,
                md5_hex: "bbb".into(),
                md5_base64: String::new(),
            },
        ];
        assert_eq!(
            build_complete_multipart(&parts),
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"aaa\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"bbb\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn last_modified_parsing() {
        let t = parse_last_modified("1970-01-01T00:01:00.000Z");
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(60));
    }
}
