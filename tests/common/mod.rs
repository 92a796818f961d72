//! Minimal Splunk stand-in for integration tests.
//!
//! Serves `/services/auth/login` and `/services/search/jobs/export` over plain
//! HTTP/1.1, one request per connection, and records every request it sees.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const SESSION_KEY: &str = "192fd3e46a31246da7ea7f109e7f95fd";

#[derive(Debug, Clone)]
pub enum LoginReply {
    /// 200 with `<sessionKey>` holding this key.
    Key(String),
    /// 401 with a "Login failed" message and no key.
    Reject,
}

#[derive(Debug, Clone)]
pub enum ExportReply {
    /// 200 with a Content-Length body.
    Csv(String),
    /// 200, chunked, one chunk per entry with `delay` between chunks.
    Chunks { chunks: Vec<String>, delay: Duration },
    /// 200 declaring `declared_len` bytes but closing after `body`.
    Truncated { body: String, declared_len: usize },
    /// Bare status with an empty body.
    Status(u16),
    /// 200, chunked, sends `head` and then holds the connection open until the
    /// client goes away.
    Stall { head: String },
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

struct Shared {
    login: LoginReply,
    export: ExportReply,
    requests: Mutex<Vec<RecordedRequest>>,
    client_closed: AtomicUsize,
}

pub struct MockSplunk {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockSplunk {
    pub async fn start(login: LoginReply, export: ExportReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            login,
            export,
            requests: Mutex::new(Vec::new()),
            client_closed: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = handle(stream, shared).await;
                });
            }
        });

        Self { addr, shared }
    }

    /// Mock that accepts the login and answers the export with `csv`.
    pub async fn with_csv(csv: &str) -> Self {
        Self::start(LoginReply::Key(SESSION_KEY.to_string()), ExportReply::Csv(csv.to_string())).await
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn export_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == "/services/search/jobs/export")
            .collect()
    }

    /// Wait until an export request has arrived.
    pub async fn wait_for_export(&self, timeout: Duration) -> bool {
        poll_until(timeout, || !self.export_requests().is_empty()).await
    }

    /// Wait until a stalled export connection has been closed by the client.
    pub async fn wait_client_closed(&self, timeout: Duration) -> bool {
        poll_until(timeout, || self.shared.client_closed.load(Ordering::SeqCst) > 0).await
    }
}

async fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// CSV body with header `fields` and `rows` rows of `r{i}c{j}` values.
pub fn csv_body(fields: &[&str], rows: usize) -> String {
    let mut body = fields.join(",");
    body.push('\n');
    for i in 0..rows {
        let row: Vec<String> = (0..fields.len()).map(|j| format!("r{i}c{j}")).collect();
        body.push_str(&row.join(","));
        body.push('\n');
    }
    body
}

async fn handle(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let path = request.path.clone();
    shared.requests.lock().unwrap().push(request);

    match path.as_str() {
        "/services/auth/login" => match &shared.login {
            LoginReply::Key(key) => {
                let body = format!("<response>\n  <sessionKey>{key}</sessionKey>\n</response>\n");
                write_response(&mut stream, 200, "text/xml", &body).await?;
            }
            LoginReply::Reject => {
                let body = "<response>\n  <messages>\n    <msg type=\"WARN\" code=\"incorrect_username_or_password\">Login failed</msg>\n  </messages>\n</response>\n";
                write_response(&mut stream, 401, "text/xml", body).await?;
            }
        },
        "/services/search/jobs/export" => match &shared.export {
            ExportReply::Csv(body) => {
                write_response(&mut stream, 200, "text/csv", body).await?;
            }
            ExportReply::Chunks { chunks, delay } => {
                write_chunked_head(&mut stream).await?;
                for chunk in chunks {
                    write_chunk(&mut stream, chunk).await?;
                    tokio::time::sleep(*delay).await;
                }
                stream.write_all(b"0\r\n\r\n").await?;
            }
            ExportReply::Truncated { body, declared_len } => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: {declared_len}\r\nConnection: close\r\n\r\n"
                );
                stream.write_all(head.as_bytes()).await?;
                stream.write_all(body.as_bytes()).await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                stream.shutdown().await?;
            }
            ExportReply::Status(status) => {
                write_response(&mut stream, *status, "text/plain", "").await?;
            }
            ExportReply::Stall { head } => {
                write_chunked_head(&mut stream).await?;
                write_chunk(&mut stream, head).await?;
                let mut scratch = [0u8; 64];
                loop {
                    match stream.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                shared.client_closed.fetch_add(1, Ordering::SeqCst);
            }
        },
        _ => {
            write_response(&mut stream, 404, "text/plain", "Not Found").await?;
        }
    }
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Ok(None),
        };

        let method = req.method.unwrap_or_default().to_string();
        let path = req.path.unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buf.len() < header_len + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let end = buf.len().min(header_len + content_length);
        let body = String::from_utf8_lossy(&buf[header_len..end]).into_owned();

        return Ok(Some(RecordedRequest {
            method,
            path,
            headers,
            body,
        }));
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

async fn write_chunked_head(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
        .await?;
    stream.flush().await
}

async fn write_chunk(stream: &mut TcpStream, chunk: &str) -> std::io::Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    let framed = format!("{:x}\r\n{chunk}\r\n", chunk.len());
    stream.write_all(framed.as_bytes()).await?;
    stream.flush().await
}
