//! The HTTP request engine: one logical request on one pooled connection.
//!
//! A [`Connection`] wraps an HTTP client pinned to the current endpoint and
//! carries the outgoing-header bag for the next request. `make_request`
//! escapes the resource, signs it, attaches the fixed header set, sends, and
//! resolves 301 redirects itself (re-targeting the shared endpoint) up to
//! `connection.max_redirects` hops. Automatic redirect following in the
//! underlying client is disabled so the engine owns the loop.

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::s3::sign;
use crate::s3::xml;
use crate::stats::Stats;

/// Bytes escaped in request paths. Reserved URL structure (`/`, `?`, `=`,
/// `&`) passes through untouched; the signing step sees the same escaped
/// form that goes on the wire.
const UNSAFE_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'%')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^')
    .add(b'[')
    .add(b']')
    .add(b'`');

pub fn escape_path(path: &str) -> String {
    utf8_percent_encode(path, UNSAFE_PATH).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

/// Where requests go. Shared by every connection of the mount so a permanent
/// redirect observed on one connection re-targets them all.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

impl Endpoint {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.s3.host.clone(),
            port: config.s3.port,
            ssl: config.s3.ssl,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Re-targets from a redirect value: either a bare host name (the XML
    /// `Endpoint` form) or a full URL from a Location header.
    pub fn set_from_location(&mut self, location: &str) {
        if location.contains("://") {
            match url::Url::parse(location) {
                Ok(parsed) => {
                    if let Some(host) = parsed.host_str() {
                        self.host = host.to_string();
                    }
                    self.ssl = parsed.scheme() == "https";
                    self.port = parsed
                        .port()
                        .unwrap_or(if self.ssl { 443 } else { 80 });
                }
                Err(e) => error!("unparsable redirect location '{}': {}", location, e),
            }
        } else {
            self.host = location.to_string();
        }
    }
}

#[derive(Debug)]
pub struct S3Response {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

impl S3Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub struct Connection {
    id: usize,
    http: reqwest::Client,
    config: Arc<Config>,
    endpoint: Arc<Mutex<Endpoint>>,
    stats: Arc<Stats>,
    /// Headers for the next request, kept sorted by key so the amz subset
    /// canonicalizes without a re-sort.
    out_headers: Vec<(String, String)>,
    jobs: u64,
    errors: u64,
}

impl Connection {
    pub fn new(
        id: usize,
        config: Arc<Config>,
        endpoint: Arc<Mutex<Endpoint>>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let timeout = std::time::Duration::from_secs(config.connection.timeout);
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Stats::bump(&stats.http_connects);
        Ok(Self {
            id,
            http,
            config,
            endpoint,
            stats,
            out_headers: Vec::new(),
            jobs: 0,
            errors: 0,
        })
    }

    /// Queues a header for the next request, keeping the bag sorted by key.
    pub fn add_output_header(&mut self, key: &str, value: &str) {
        let pos = self
            .out_headers
            .partition_point(|(k, _)| k.as_str() <= key);
        self.out_headers
            .insert(pos, (key.to_string(), value.to_string()));
    }

    /// Issues one logical request. `resource_path` starts with '/' and may
    /// carry a query string; the bucket is prepended here when path-style
    /// addressing is configured. Success means 200, 204 or 206.
    pub async fn make_request(
        &mut self,
        resource_path: &str,
        method: HttpMethod,
        body: Option<Bytes>,
    ) -> Result<S3Response> {
        let escaped = escape_path(resource_path);
        let headers = std::mem::take(&mut self.out_headers);
        let started = Instant::now();
        self.jobs += 1;
        Stats::bump(&self.stats.http_jobs);

        let mut redirects = 0u32;
        loop {
            let (base_url, host) = {
                let ep = self.endpoint.lock().unwrap();
                (ep.base_url(), ep.host.clone())
            };
            let request_path = if self.config.s3.path_style {
                format!("/{}{}", self.config.s3.bucket_name, escaped)
            } else {
                escaped.clone()
            };
            let url = format!("{}{}", base_url, request_path);

            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let string_to_sign = sign::string_to_sign(
                method.as_str(),
                &self.config.s3.bucket_name,
                &escaped,
                &date,
                &headers,
            );
            let signature = sign::sign(&self.config.s3.secret_access_key, &string_to_sign);

            info!("[conn {}] {} {}", self.id, method.as_str(), url);

            let mut request = self
                .http
                .request(method.to_reqwest(), &url)
                .header("Authorization", sign::authorization(&self.config.s3.access_key_id, &signature))
                .header("Host", &host)
                .header("Date", &date)
                .header("Connection", "keep-alive")
                .header("Accept-Encoding", "identity");
            for (key, value) in &headers {
                request = request.header(key.as_str(), value.as_str());
            }
            let sent = body.as_ref().map(|b| b.len()).unwrap_or(0);
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    error!("[conn {}] request failed: {}", self.id, e);
                    return Err(e.into());
                }
            };

            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            let response_body = response.bytes().await.map_err(|e| {
                self.errors += 1;
                Stats::bump(&self.stats.http_errors);
                Error::Transport(format!("failed to read response body: {}", e))
            })?;

            let header_bytes: usize = response_headers
                .iter()
                .map(|(k, v)| k.as_str().len() + v.len())
                .sum();
            Stats::add(&self.stats.bytes_out, sent as u64);
            Stats::add(
                &self.stats.bytes_in,
                (header_bytes + response_body.len()) as u64,
            );
            self.stats.add_history(format!(
                "[conn {}] {} {} HTTP {} (sent: {} received: {} bytes, {} ms)",
                self.id,
                method.as_str(),
                url,
                status,
                sent,
                response_body.len(),
                started.elapsed().as_millis()
            ));

            if status == 301 {
                redirects += 1;
                if redirects > self.config.connection.max_redirects {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    return Err(Error::Protocol("too many redirects".into()));
                }
                let location = response_headers
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .or_else(|| xml::parse_redirect_endpoint(&response_body));
                let Some(location) = location else {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    return Err(Error::Protocol("redirect without a target".into()));
                };
                debug!("[conn {}] redirected to {}", self.id, location);
                self.endpoint.lock().unwrap().set_from_location(&location);
                continue;
            }

            return match status {
                200 | 204 | 206 => Ok(S3Response {
                    status,
                    headers: response_headers,
                    body: response_body,
                }),
                404 => {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    Err(Error::NotFound(format!(
                        "{} {}",
                        method.as_str(),
                        resource_path
                    )))
                }
                401 | 403 => {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    Err(Error::Auth(format!("server returned HTTP {}", status)))
                }
                412 => {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    Err(Error::Precondition(format!(
                        "{} {}",
                        method.as_str(),
                        resource_path
                    )))
                }
                _ => {
                    self.errors += 1;
                    Stats::bump(&self.stats.http_errors);
                    if !response_body.is_empty() {
                        debug!(
                            "[conn {}] error body: {}",
                            self.id,
                            String::from_utf8_lossy(&response_body)
                        );
                    }
                    Err(Error::Protocol(format!(
                        "server returned HTTP {} for {} {}",
                        status,
                        method.as_str(),
                        resource_path
                    )))
                }
            };
        }
    }

    pub fn jobs(&self) -> u64 {
        self.jobs
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(config: Config) -> Connection {
        let config = Arc::new(config);
        let endpoint = Arc::new(Mutex::new(Endpoint::from_config(&config)));
        let stats = Arc::new(Stats::new(16));
        Connection::new(0, config, endpoint, stats).unwrap()
    }

    #[test]
    fn escape_keeps_url_structure() {
        assert_eq!(escape_path("/a/b.txt"), "/a/b.txt");
        assert_eq!(
            escape_path("/file?partNumber=2&uploadId=abc"),
            "/file?partNumber=2&uploadId=abc"
        );
        assert_eq!(escape_path("/with space"), "/with%20space");
        assert_eq!(escape_path("/100%"), "/100%25");
    }

    #[test]
    fn output_headers_stay_sorted() {
        let mut conn = test_connection(Config::default());
        conn.add_output_header("x-amz-storage-class", "STANDARD");
        conn.add_output_header("Content-MD5", "abcd");
        conn.add_output_header("x-amz-meta-date", "today");
        let keys: Vec<&str> = conn.out_headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["Content-MD5", "x-amz-meta-date", "x-amz-storage-class"]
        );
    }

    #[test]
    fn endpoint_from_bare_host() {
        let mut ep = Endpoint {
            host: "s3.amazonaws.com".into(),
            port: 80,
            ssl: false,
        };
        ep.set_from_location("bucket.s3-eu-west-1.amazonaws.com");
        assert_eq!(ep.host, "bucket.s3-eu-west-1.amazonaws.com");
        assert_eq!(ep.port, 80);
        assert_eq!(ep.base_url(), "http://bucket.s3-eu-west-1.amazonaws.com:80");
    }

    #[test]
    fn endpoint_from_full_url() {
        let mut ep = Endpoint {
            host: "s3.amazonaws.com".into(),
            port: 80,
            ssl: false,
        };
        ep.set_from_location("https://bucket.s3.example.com/key");
        assert_eq!(ep.host, "bucket.s3.example.com");
        assert_eq!(ep.port, 443);
        assert!(ep.ssl);
    }

    #[tokio::test]
    async fn transport_error_surfaces_and_counts() {
        let mut config = Config::default();
        config.s3.host = "127.0.0.1".into();
        config.s3.port = 1; // nothing listens here
        config.connection.timeout = 1;
        let mut conn = test_connection(config);
        match conn.make_request("/probe", HttpMethod::Get, None).await {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(conn.errors(), 1);
        assert_eq!(conn.jobs(), 1);
    }
}
