//! One HTTP/1.1 connection to one node for one service family. Requests
//! are strictly FIFO: the session processes one at a time, queuing
//! concurrent callers behind it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use fathom_core::config::Credentials;
use fathom_core::identity;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::stream::BoxedStream;
use crate::tls::TlsConfig;

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// A request carrying the headers every dispatched call must send:
    /// HTTP basic `Authorization`, a `User-Agent` naming this client,
    /// and a per-call `client-context-id` a server-side log line can be
    /// traced back to.
    pub fn for_dispatch(method: impl Into<String>, path: impl Into<String>, credentials: &Credentials) -> Self {
        let basic = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        Self::new(method, path)
            .with_header("Authorization", format!("Basic {basic}"))
            .with_header("User-Agent", identity::user_agent())
            .with_header("client-context-id", identity::next_client_context_id())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    fn encode(&self, host: &str) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.path, host)
            .into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Clone, Debug, Error)]
pub enum HttpError {
    #[error("io error: {0}")]
    Io(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("session closed")]
    SessionClosed,
}

type PendingCall = (HttpRequest, oneshot::Sender<Result<HttpResponse, HttpError>>);

/// A handle to a pooled HTTP/1.1 connection. Cloning shares the same
/// underlying worker task and request queue.
#[derive(Clone)]
pub struct HttpSession {
    queue: mpsc::Sender<PendingCall>,
    host: String,
}

impl HttpSession {
    pub async fn connect(
        addr: std::net::SocketAddr,
        host: impl Into<String>,
        tls: Option<&TlsConfig>,
    ) -> Result<Self, HttpError> {
        let tcp = TcpStream::connect(addr).await.map_err(|e| HttpError::Io(e.to_string()))?;
        let host = host.into();
        let stream: BoxedStream = match tls {
            Some(tls) => tls
                .connect(tcp, &host)
                .await
                .map_err(|e| HttpError::Io(e.to_string()))?,
            None => Box::new(tcp),
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(Self::worker(stream, rx, host.clone()));
        Ok(Self { queue: tx, host })
    }

    /// Enqueue a request; the FIFO worker task writes it and parses the
    /// matching response before moving to the next queued caller.
    pub async fn submit(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send((request, tx))
            .await
            .map_err(|_| HttpError::SessionClosed)?;
        rx.await.map_err(|_| HttpError::SessionClosed)?
    }

    pub fn is_idle(&self) -> bool {
        self.queue.capacity() == self.queue.max_capacity()
    }

    /// A session handle with no worker task behind it, for pool tests
    /// that only need something to put in an idle slot.
    #[cfg(test)]
    pub(crate) fn from_queue_for_test() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { queue: tx, host: "test".to_string() }
    }

    async fn worker(mut stream: BoxedStream, mut rx: mpsc::Receiver<PendingCall>, host: String) {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        while let Some((request, reply)) = rx.recv().await {
            let result = Self::run_one(&mut stream, &mut buf, &request, &host).await;
            let _ = reply.send(result);
        }
    }

    async fn run_one(
        stream: &mut BoxedStream,
        buf: &mut BytesMut,
        request: &HttpRequest,
        host: &str,
    ) -> Result<HttpResponse, HttpError> {
        let encoded = request.encode(host);
        stream.write_all(&encoded).await.map_err(|e| HttpError::Io(e.to_string()))?;

        loop {
            if let Some(response) = try_parse_response(buf)? {
                return Ok(response);
            }
            let mut scratch = [0u8; 4096];
            let n = stream.read(&mut scratch).await.map_err(|e| HttpError::Io(e.to_string()))?;
            if n == 0 {
                return Err(HttpError::SessionClosed);
            }
            buf.extend_from_slice(&scratch[..n]);
        }
    }
}

/// Parse one response out of `buf` if a complete header block plus body
/// (by `Content-Length` or chunked `0\r\n\r\n` terminator) is present.
/// Consumes the parsed bytes from `buf` on success.
fn try_parse_response(buf: &mut BytesMut) -> Result<Option<HttpResponse>, HttpError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);

    let header_len = match response
        .parse(buf)
        .map_err(|e| HttpError::Malformed(e.to_string()))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let status = response.code.ok_or_else(|| HttpError::Malformed("missing status code".into()))?;
    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let is_chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    if is_chunked {
        match decode_chunked(&buf[header_len..]) {
            Some((body, consumed)) => {
                let total = header_len + consumed;
                let frame = buf.split_to(total);
                let _ = frame;
                Ok(Some(HttpResponse { status, headers, body: Bytes::from(body) }))
            }
            None => Ok(None),
        }
    } else {
        if buf.len() < header_len + content_length {
            return Ok(None);
        }
        let mut frame = buf.split_to(header_len + content_length);
        let body = frame.split_off(header_len).freeze();
        Ok(Some(HttpResponse { status, headers, body }))
    }
}

/// Decode a chunked body, returning `(body, bytes_consumed)` once the
/// terminating zero-length chunk has been seen.
fn decode_chunked(mut data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut body = Vec::new();
    let mut consumed = 0usize;
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&data[..line_end]).ok()?;
        let size = usize::from_str_radix(size_line.trim(), 16).ok()?;
        let after_size_line = line_end + 2;
        consumed += after_size_line;
        data = &data[after_size_line..];

        if size == 0 {
            consumed += 2; // trailing CRLF after the terminating chunk
            return Some((body, consumed));
        }
        if data.len() < size + 2 {
            return None;
        }
        body.extend_from_slice(&data[..size]);
        consumed += size + 2;
        data = &data[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_response_parses_once_body_is_buffered() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let response = try_parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_response_is_not_yet_ready() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel"[..]);
        assert_eq!(try_parse_response(&mut buf).unwrap(), None);
    }

    #[test]
    fn chunked_body_is_reassembled() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"[..],
        );
        let response = try_parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(&response.body[..], b"Wikipedia");
    }

    #[test]
    fn request_encoding_includes_content_length_when_body_present() {
        let request = HttpRequest::new("POST", "/query/service")
            .with_header("Content-Type", "application/json")
            .with_body(Bytes::from_static(b"{}"));
        let encoded = String::from_utf8(request.encode("localhost")).unwrap();
        assert!(encoded.contains("Content-Length: 2"));
        assert!(encoded.starts_with("POST /query/service HTTP/1.1\r\n"));
    }
}
