//! Minimal HTTP/1.1 request sniffing for the listen socket.
//!
//! Only the request line and the `Upgrade` header matter: upgrade requests
//! continue to the WebSocket handshake, everything else gets the plain-text
//! status page.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parsed request head plus every byte read from the socket so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method (`GET`, `HEAD`, ...).
    pub method: String,
    /// Request target, including any query string.
    pub path: String,
    /// Client asked for `Upgrade: websocket`.
    pub is_websocket: bool,
    /// Raw bytes consumed, to be replayed into the handshake.
    pub raw: Vec<u8>,
}

/// Read until the end of the request head (`\r\n\r\n`).
///
/// Fails with `InvalidData` if the head exceeds `max_len` or is malformed,
/// `TimedOut` after `timeout`, and `UnexpectedEof` if the client hangs up.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_len: usize,
    timeout: Duration,
) -> io::Result<RequestHead> {
    tokio::time::timeout(timeout, read_head_inner(stream, max_len))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head timed out"))?
}

async fn read_head_inner<S: AsyncRead + Unpin>(stream: &mut S, max_len: usize) -> io::Result<RequestHead> {
    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client closed before request head"));
        }
        raw.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&raw) {
            let head = parse_head(&raw[..end])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed request head"))?;
            return Ok(RequestHead { raw, ..head });
        }
        if raw.len() > max_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse a request head (without body). Returns `None` if the request line
/// is malformed.
pub fn parse_head(head: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    if !request_line.next()?.starts_with("HTTP/") {
        return None;
    }

    let is_websocket = lines.filter_map(|line| line.split_once(':')).any(|(name, value)| {
        name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
    });

    Some(RequestHead {
        method,
        path,
        is_websocket,
        raw: Vec::new(),
    })
}

/// Write a `200 OK` plain-text response and shut down the write half.
pub async fn write_status_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    method: &str,
    body: &str,
) -> io::Result<()> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if method != "HEAD" {
        response.push_str(body);
    }
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /YXBwOjMzMzM?x=1 HTTP/1.1\r\nHost: relay\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_parse_upgrade_request() {
        let head = parse_head(UPGRADE).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/YXBwOjMzMzM?x=1");
        assert!(head.is_websocket);
    }

    #[test]
    fn test_parse_plain_request() {
        let head = parse_head(b"GET / HTTP/1.1\r\nHost: relay\r\n\r\n").unwrap();
        assert!(!head.is_websocket);
        assert_eq!(head.path, "/");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_head(b"\x16\x03\x01 tls hello").is_none());
        assert!(parse_head(b"GET /\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_read_head_keeps_all_bytes() {
        let mut input = UPGRADE.to_vec();
        input.extend_from_slice(b"trailing");
        let mut reader = &input[..];

        let head = read_request_head(&mut reader, 8192, Duration::from_secs(1)).await.unwrap();

        assert!(head.is_websocket);
        assert_eq!(head.raw, input);
    }

    #[tokio::test]
    async fn test_read_head_rejects_oversized() {
        let input = vec![b'a'; 4096];
        let mut reader = &input[..];

        let err = read_request_head(&mut reader, 1024, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = read_request_head(&mut reader, 1024, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_head_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_request_head(&mut server, 1024, Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_status_response() {
        let mut out = Vec::new();
        write_status_response(&mut out, "GET", "running\n").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("\r\n\r\nrunning\n"));
    }
}
