//! A minimal in-process object store for integration tests.
//!
//! Listens on a loopback port, parses HTTP/1.1 requests (keep-alive
//! included), records every request it sees, and answers from a
//! test-provided handler. Enough protocol surface to stand in for the real
//! store without pulling a server framework into the dev-dependencies.

use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bucketfs::config::Config;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    /// Request path including the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type Handler = Arc<dyn Fn(&Recorded) -> MockResponse + Send + Sync>;

pub struct MockStore {
    pub port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockStore {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    serve_connection(stream, handler, recorded).await;
                });
            }
        });

        Self { port, requests }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Handler,
    recorded: Arc<Mutex<Vec<Recorded>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let header_end = loop {
            if let Some(pos) = find_blank_line(&buf) {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        let mut headers = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);

        let body_start = header_end + 4;
        while buf.len() < body_start + content_length {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body = buf[body_start..body_start + content_length].to_vec();
        buf.drain(..body_start + content_length);

        let request = Recorded {
            method: method.clone(),
            path,
            headers,
            body,
        };
        let response = handler(&request);
        recorded.lock().unwrap().push(request);

        let mut out = format!("HTTP/1.1 {} Mock\r\n", response.status);
        let explicit_length = response
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        if !explicit_length {
            out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        }
        for (name, value) in &response.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("Connection: keep-alive\r\n\r\n");
        if stream.write_all(out.as_bytes()).await.is_err() {
            return;
        }
        if method != "HEAD" && !response.body.is_empty() {
            if stream.write_all(&response.body).await.is_err() {
                return;
            }
        }
    }
}

/// Configuration pointed at the mock store, with the cache under a test
/// directory.
pub fn test_config(port: u16, cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.s3.host = "127.0.0.1".to_string();
    config.s3.port = port;
    config.s3.ssl = false;
    config.s3.bucket_name = "testbucket".to_string();
    config.s3.access_key_id = "AKID".to_string();
    config.s3.secret_access_key = "SECRET".to_string();
    config.connection.timeout = 5;
    config.filesystem.cache_dir = cache_dir.to_str().unwrap().to_string();
    config
}
