//! HTTP proxy front-end (component F): `CONNECT` tunneling and plain
//! request forwarding on the same listener. Grounded in the teacher's
//! `extract_http_host` / `detect_connection_type` request sniffing, but
//! generalized from "decide where a raw TLS/WS stream should be routed"
//! into a full proxy that dials the target itself.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::error::ProtocolError;
use crate::system::accounting::{TrafficAccountant, TrafficTag};
use crate::system::pump::relay_tcp;
use crate::system::registry::{ConnectionRegistry, Direction};

/// Hard cap on the request head (request line + headers) this proxy will
/// buffer before giving up, per spec §9: a client that never sends a blank
/// line gets a 400 rather than unbounded memory growth.
const MAX_HEAD_SIZE: usize = 8 * 1024;

struct RequestHead {
    method: String,
    target: String,
    raw: Vec<u8>,
}

pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
) {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(ProtocolError::HeadTooLarge) => {
            let _ = write_status(&mut stream, 400, "Bad Request").await;
            return;
        }
        Err(e) => {
            debug!("http {peer}: malformed request: {e}");
            let _ = write_status(&mut stream, 400, "Bad Request").await;
            return;
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, peer, &head.target, registry, accountant).await;
    } else {
        handle_forward(stream, peer, &head, registry, accountant).await;
    }
}

/// Reads up to the first blank line (`\r\n\r\n`), enforcing [`MAX_HEAD_SIZE`].
async fn read_request_head(stream: &mut TcpStream) -> Result<RequestHead, ProtocolError> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if raw.len() >= MAX_HEAD_SIZE {
            return Err(ProtocolError::HeadTooLarge);
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        raw.push(byte[0]);
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::MalformedHttp("non-utf8 head".into()))?;
    let request_line = text
        .lines()
        .next()
        .ok_or_else(|| ProtocolError::MalformedHttp("empty request line".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedHttp("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedHttp("missing request target".into()))?
        .to_string();

    Ok(RequestHead { method, target, raw })
}

/// Pulls the `Host:` header out of an already-buffered request head.
fn extract_host(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("Host:").or_else(|| line.strip_prefix("host:")))
        .map(|value| value.trim().to_string())
}

/// Splits a `host:port` authority, defaulting the port to `default_port`
/// when absent. Used for plain forwarding, where the `Host:` header is
/// commonly bare.
fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

/// Splits a `CONNECT` target, which per spec §4.F requires both a host and
/// a port in `[1, 65535]` — no default. Returns `None` on any malformed
/// shape (missing colon, missing host, non-numeric or out-of-range port).
fn split_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

async fn handle_connect(
    mut stream: TcpStream,
    peer: SocketAddr,
    target: &str,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
) {
    let (host, port) = match split_connect_target(target) {
        Some(parsed) => parsed,
        None => {
            debug!("http {peer}: malformed CONNECT target {target:?}");
            let _ = write_status(&mut stream, 400, "Bad Request").await;
            return;
        }
    };

    let conn = registry.register(Direction::Inbound);
    let cancel = conn.cancel_token();

    let outbound = match dial(&host, port).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("http {peer}: CONNECT dial to {host}:{port} failed: {e}");
            let _ = write_status(&mut stream, 502, "Bad Gateway").await;
            return;
        }
    };

    if stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    info!("http {peer}: CONNECT tunnel to {host}:{port}");
    relay_tcp(
        stream,
        outbound,
        TrafficTag::Upload,
        TrafficTag::Download,
        accountant,
        cancel,
    )
    .await;
    drop(conn);
}

async fn handle_forward(
    mut stream: TcpStream,
    peer: SocketAddr,
    head: &RequestHead,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
) {
    let authority = match extract_host(&head.raw) {
        Some(host) => host,
        None => {
            debug!("http {peer}: missing Host header");
            let _ = write_status(&mut stream, 400, "Bad Request").await;
            return;
        }
    };
    let (host, port) = split_authority(&authority, 80);

    let conn = registry.register(Direction::Inbound);
    let cancel = conn.cancel_token();

    let mut outbound = match dial(&host, port).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("http {peer}: forward dial to {host}:{port} failed: {e}");
            let _ = write_status(&mut stream, 502, "Bad Gateway").await;
            return;
        }
    };

    if outbound.write_all(&head.raw).await.is_err() {
        return;
    }
    accountant.record_up(head.raw.len());

    info!("http {peer}: forwarding to {host}:{port}");
    relay_tcp(
        stream,
        outbound,
        TrafficTag::Upload,
        TrafficTag::Download,
        accountant,
        cancel,
    )
    .await;
    drop(conn);
}

async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let target = addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {host}"))
    })?;
    let socket = if target.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.connect(target).await
}

/// Writes the exact reply spec §6 specifies: a status line, a
/// `Content-Length: 0`, and no body.
async fn write_status(stream: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
    let response = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\n\r\n");
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_host_is_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nhost: example.com:8080\r\n\r\n";
        assert_eq!(extract_host(raw), Some("example.com:8080".to_string()));
    }

    #[test]
    fn extract_host_returns_none_without_header() {
        let raw = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n\r\n";
        assert_eq!(extract_host(raw), None);
    }

    #[test]
    fn split_authority_defaults_port() {
        assert_eq!(split_authority("example.com", 80), ("example.com".to_string(), 80));
        assert_eq!(
            split_authority("example.com:8443", 443),
            ("example.com".to_string(), 8443)
        );
    }

    #[test]
    fn split_connect_target_requires_explicit_port() {
        assert_eq!(
            split_connect_target("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(split_connect_target("example.com"), None);
        assert_eq!(split_connect_target("example.com:0"), None);
        assert_eq!(split_connect_target("example.com:not-a-port"), None);
        assert_eq!(split_connect_target(":443"), None);
    }

    #[tokio::test]
    async fn read_request_head_stops_at_blank_line() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nbody-not-included")
            .await
            .unwrap();

        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/");
        assert!(head.raw.ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_request_head_caps_at_max_size() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let oversized = vec![b'a'; MAX_HEAD_SIZE + 10];
        tokio::spawn(async move {
            let _ = client.write_all(&oversized).await;
        });

        let result = read_request_head(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::HeadTooLarge)));
    }
}
