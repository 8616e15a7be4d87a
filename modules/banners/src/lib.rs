//! Banner retrieval for AV control ports: line-oriented control channels
//! (telnet-style, Kramer P3000, Lightware LW3) and plain HTTP.

use anyhow::Result;
use avtool_core::codec::strip_control_protocol;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

/// Ports that get the line-oriented probe, in preference order of appearance.
pub const LINE_PORTS: [u16; 3] = [23, 5000, 6100];
/// Port on which the model query is sent after the greeting window.
pub const MODEL_QUERY_PORT: u16 = 5000;
pub const MODEL_QUERY: &[u8] = b"#MODEL?\r\n";
pub const HTTP_PORT: u16 = 80;

/// Case-sensitive vendor names looked for in an HTTP response head.
pub const VENDOR_KEYWORDS: [&str; 6] = ["Samsung", "Extron", "Kramer", "Lightware", "AMX", "Crestron"];

const LINE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const GREETING_WINDOW: Duration = Duration::from_millis(220);
const MODEL_REPLY_WINDOW: Duration = Duration::from_millis(260);
const LINE_LIMIT: usize = 512;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_millis(220);
const HTTP_WINDOW: Duration = Duration::from_millis(260);
const HTTP_HEAD_LIMIT: usize = 900;
const HTTP_REQUEST: &[u8] = b"GET / HTTP/1.0\r\nHost: x\r\nUser-Agent: avtool\r\n\r\n";

/// Read into `buf` until the window closes, the peer closes, `limit` bytes
/// arrive or `done` says the content is complete.
async fn read_window(stream: &mut TcpStream, buf: &mut Vec<u8>, limit: usize, window: Duration, done: fn(&[u8]) -> bool) {
    let deadline = Instant::now() + window;
    let mut chunk = [0u8; 256];
    while buf.len() < limit && !done(buf) {
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                let take = n.min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
}

fn never(_: &[u8]) -> bool {
    false
}

fn head_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Whatever the peer volunteers shortly after connecting, optionally followed
/// by the reply to [`MODEL_QUERY`]. Telnet negotiation is stripped.
pub async fn grab_line_banner(addr: SocketAddr, model_query: bool) -> Result<Option<String>> {
    let mut stream = timeout(LINE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
    let mut buf = Vec::with_capacity(LINE_LIMIT);
    read_window(&mut stream, &mut buf, LINE_LIMIT, GREETING_WINDOW, never).await;
    if model_query && buf.len() < LINE_LIMIT && stream.write_all(MODEL_QUERY).await.is_ok() {
        read_window(&mut stream, &mut buf, LINE_LIMIT, MODEL_REPLY_WINDOW, never).await;
    }
    let text = strip_control_protocol(&buf);
    let text = text.trim();
    Ok(if text.is_empty() { None } else { Some(text.to_string()) })
}

/// Minimal `GET /` and a scrape of the response head.
pub async fn grab_http_banner(addr: SocketAddr) -> Result<Option<String>> {
    let mut stream = timeout(HTTP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
    stream.write_all(HTTP_REQUEST).await?;
    let mut buf = Vec::with_capacity(HTTP_HEAD_LIMIT);
    read_window(&mut stream, &mut buf, HTTP_HEAD_LIMIT, HTTP_WINDOW, head_complete).await;
    Ok(summarize_http_head(&String::from_utf8_lossy(&buf)))
}

/// `Server:` header value followed by every vendor keyword found anywhere in
/// the captured head, space separated.
pub fn summarize_http_head(head: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(i) = head.find("Server:") {
        let rest = &head[i + "Server:".len()..];
        if let Some(end) = rest.find("\r\n") {
            let server = rest[..end].trim();
            if !server.is_empty() {
                parts.push(server);
            }
        }
    }
    parts.extend(VENDOR_KEYWORDS.iter().copied().filter(|k| head.contains(k)));
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Best banner for a host: the first line-oriented port that yields text,
/// else the HTTP head scrape if port 80 is open, else empty.
pub async fn grab_banner(ip: IpAddr, open_ports: &[u16]) -> String {
    for &port in open_ports.iter().filter(|p| LINE_PORTS.contains(p)) {
        match grab_line_banner(SocketAddr::new(ip, port), port == MODEL_QUERY_PORT).await {
            Ok(Some(text)) => return text,
            Ok(None) => {}
            Err(e) => debug!(%ip, port, "line banner failed: {}", e),
        }
    }
    if open_ports.contains(&HTTP_PORT) {
        match grab_http_banner(SocketAddr::new(ip, HTTP_PORT)).await {
            Ok(Some(text)) => return text,
            Ok(None) => {}
            Err(e) => debug!(%ip, "http banner failed: {}", e),
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn http_head_server_and_vendors() {
        let head = "HTTP/1.0 200 OK\r\nServer: Extron Web Server\r\nContent-Type: text/html\r\n\r\n<title>Crestron</title>";
        assert_eq!(summarize_http_head(head).as_deref(), Some("Extron Web Server Extron Crestron"));
    }

    #[test]
    fn http_head_keywords_are_case_sensitive() {
        assert_eq!(summarize_http_head("HTTP/1.0 200 OK\r\n\r\nkramer amx"), None);
        assert_eq!(summarize_http_head("HTTP/1.0 200 OK\r\n\r\nKRAMER AMX").as_deref(), Some("AMX"));
    }

    #[test]
    fn http_head_without_terminated_server_line() {
        assert_eq!(summarize_http_head("HTTP/1.0 200 OK\r\nServer: lighttpd"), None);
    }

    #[tokio::test]
    async fn line_banner_strips_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(&[0xFF, 0xFB, 0x01]).await.unwrap();
            s.write_all(b"(c) Copyright 2020, Extron Electronics\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        });
        let banner = grab_line_banner(addr, false).await.unwrap();
        assert_eq!(banner.as_deref(), Some("(c) Copyright 2020, Extron Electronics"));
    }

    #[tokio::test]
    async fn model_query_reply_is_appended() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], MODEL_QUERY);
            s.write_all(b"~01@MODEL VS-88H\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        });
        let banner = grab_line_banner(addr, true).await.unwrap();
        assert_eq!(banner.as_deref(), Some("~01@MODEL VS-88H"));
    }

    #[tokio::test]
    async fn silent_peer_has_no_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        });
        assert_eq!(grab_line_banner(addr, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn http_banner_from_live_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = s.read(&mut buf).await.unwrap();
            s.write_all(b"HTTP/1.0 200 OK\r\nServer: Lightware HTTP\r\n\r\n").await.unwrap();
        });
        let banner = grab_http_banner(addr).await.unwrap();
        assert_eq!(banner.as_deref(), Some("Lightware HTTP Lightware"));
    }
}
