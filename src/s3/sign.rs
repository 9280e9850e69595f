//! AWS signature version 2.
//!
//! The string to sign concatenates the HTTP verb, the Content-MD5 of the
//! body (empty when absent), the Content-Type (empty in practice), the Date
//! header, the canonicalized x-amz- headers, and the canonicalized resource.
//! The signature is the base64 of the HMAC-SHA1 of that string under the
//! secret access key.
//!
//! <http://docs.amazonwebservices.com/Amazon/2006-03-01/dev/RESTAuthentication.html>

use base64::encode as base64_encode;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Sub-resources that are kept in the canonicalized resource when the
/// request addresses the bucket itself.
const KEPT_SUBRESOURCES: [&str; 3] = ["?acl", "?versioning", "?versions"];

/// Builds the canonicalized resource for `resource` (an already-escaped
/// path starting with '/').
///
/// A bucket-level request (`/?...`) canonicalizes to `/<bucket>/` unless it
/// names one of the retained sub-resources; anything else is
/// `/<bucket><resource>`.
fn canonical_resource(bucket: &str, resource: &str) -> String {
    if resource.len() > 2 && resource.as_bytes()[1] == b'?' {
        if KEPT_SUBRESOURCES.iter().any(|s| resource.contains(s)) {
            format!("/{}{}", bucket, resource)
        } else {
            format!("/{}/", bucket)
        }
    } else {
        format!("/{}{}", bucket, resource)
    }
}

/// Assembles the string to sign.
///
/// `headers` are the outgoing request headers, already sorted by key;
/// Content-MD5 is pulled from them and every header whose name contains
/// `x-amz-` contributes a `key:value\n` line, lower-cased, in order.
pub fn string_to_sign(
    method: &str,
    bucket: &str,
    resource: &str,
    date: &str,
    headers: &[(String, String)],
) -> String {
    let mut content_md5 = "";
    let mut amz_headers = String::new();
    for (key, value) in headers {
        if key == "Content-MD5" {
            content_md5 = value;
        } else if key.to_ascii_lowercase().contains("x-amz-") {
            amz_headers.push_str(&key.to_ascii_lowercase());
            amz_headers.push(':');
            amz_headers.push_str(value);
            amz_headers.push('\n');
        }
    }

    let content_type = "";
    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        method,
        content_md5,
        content_type,
        date,
        amz_headers,
        canonical_resource(bucket, resource)
    )
}

/// HMAC-SHA1 of `string_to_sign` under the secret key, base64-encoded.
pub fn sign(secret_access_key: &str, string_to_sign: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret_access_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    base64_encode(mac.finalize().into_bytes())
}

/// Value of the Authorization header.
pub fn authorization(access_key_id: &str, signature: &str) -> String {
    format!("AWS {}:{}", access_key_id, signature)
}
