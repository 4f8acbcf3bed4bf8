//! SOCKS5 `CONNECT` core (component G): greeting, method selection, the
//! request/reply state machine, and the `CONNECT` relay itself. `UDP
//! ASSOCIATE` requests are accepted here and handed off to
//! [`super::udp`], since both share the same control connection and
//! greeting handshake.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{ProtocolError, Socks5Reply};
use crate::protocol::address::Address;
use crate::system::accounting::{TrafficAccountant, TrafficTag};
use crate::system::pump::relay_tcp;
use crate::system::registry::{ConnectionRegistry, Direction};

use super::{CMD_CONNECT, CMD_UDP_ASSOCIATE, METHOD_NONE_ACCEPTABLE, METHOD_NO_AUTH, SOCKS5_VERSION};

/// Drives one accepted TCP connection through the SOCKS5 handshake and
/// either a `CONNECT` relay or a `UDP ASSOCIATE` hand-off. `udp_relay_addr`
/// is the engine's single shared UDP relay address (LAN IPv4, `udp_port`);
/// it is only consulted for `CMD_UDP_ASSOCIATE`.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
    udp_relay_addr: Option<SocketAddr>,
) {
    if let Err(e) = negotiate_method(&mut stream).await {
        debug!("socks5 {peer}: method negotiation failed: {e}");
        return;
    }

    let (cmd, addr, port) = match read_request(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("socks5 {peer}: malformed request: {e}");
            let _ = send_reply(&mut stream, Socks5Reply::from(&e), None).await;
            return;
        }
    };

    match cmd {
        CMD_CONNECT => handle_connect(stream, peer, addr, port, registry, accountant).await,
        CMD_UDP_ASSOCIATE => match udp_relay_addr {
            Some(bound) => super::udp::handle_associate(stream, peer, registry, bound).await,
            None => {
                warn!("socks5 {peer}: udp associate requested but no relay socket is running");
                let _ = send_reply(&mut stream, Socks5Reply::GeneralFailure, None).await;
            }
        },
        other => {
            debug!("socks5 {peer}: unsupported command {other:#04x}");
            let _ = send_reply(&mut stream, Socks5Reply::CommandNotSupported, None).await;
        }
    }
}

/// Reads the greeting (`VER NMETHODS METHODS...`) and replies with
/// `METHOD_NO_AUTH` if offered, else `METHOD_NONE_ACCEPTABLE`. This engine
/// never advertises username/password or GSSAPI (spec §4.G: no-auth only).
async fn negotiate_method(stream: &mut TcpStream) -> Result<(), ProtocolError> {
    let version = stream
        .read_u8()
        .await
        .map_err(|_| ProtocolError::Truncated)?;
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let nmethods = stream
        .read_u8()
        .await
        .map_err(|_| ProtocolError::Truncated)? as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|_| ProtocolError::Truncated)?;

    let chosen = if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NONE_ACCEPTABLE
    };

    stream
        .write_all(&[SOCKS5_VERSION, chosen])
        .await
        .map_err(|_| ProtocolError::Truncated)?;

    if chosen == METHOD_NONE_ACCEPTABLE {
        return Err(ProtocolError::Truncated);
    }
    Ok(())
}

/// Reads `VER CMD RSV ATYP DST.ADDR DST.PORT`.
async fn read_request(stream: &mut TcpStream) -> Result<(u8, Address, u16), ProtocolError> {
    let version = stream
        .read_u8()
        .await
        .map_err(|_| ProtocolError::Truncated)?;
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let cmd = stream
        .read_u8()
        .await
        .map_err(|_| ProtocolError::Truncated)?;
    let _rsv = stream
        .read_u8()
        .await
        .map_err(|_| ProtocolError::Truncated)?;
    let (addr, port) = Address::read_with_port(stream).await?;
    Ok((cmd, addr, port))
}

/// Writes `VER REP RSV ATYP BND.ADDR BND.PORT`. `bound` defaults to
/// `0.0.0.0:0` when the command failed before a bind/dial ever happened.
pub(super) async fn send_reply(
    stream: &mut TcpStream,
    reply: Socks5Reply,
    bound: Option<SocketAddr>,
) -> std::io::Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut out = vec![SOCKS5_VERSION, reply as u8, 0x00];
    let addr: Address = bound.into();
    addr.encode_with_port(bound.port(), &mut out);
    stream.write_all(&out).await
}

async fn handle_connect(
    mut stream: TcpStream,
    peer: SocketAddr,
    addr: Address,
    port: u16,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
) {
    let conn = registry.register(Direction::Inbound);
    let cancel = conn.cancel_token();

    let target = match addr.resolve(port).await {
        Ok(target) => target,
        Err(e) => {
            warn!("socks5 {peer}: resolve {addr}:{port} failed: {e}");
            let _ = send_reply(&mut stream, Socks5Reply::GeneralFailure, None).await;
            return;
        }
    };

    let outbound = match dial(target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            debug!("socks5 {peer}: connect to {target} failed: {e}");
            let reply = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Socks5Reply::ConnectionRefused,
                _ => Socks5Reply::GeneralFailure,
            };
            let _ = send_reply(&mut stream, reply, None).await;
            return;
        }
    };

    // Per spec §4.G the success reply always carries 0.0.0.0:0 as
    // BND.ADDR/BND.PORT; this engine does not report the real bound
    // address of the outbound socket.
    if send_reply(&mut stream, Socks5Reply::Success, None)
        .await
        .is_err()
    {
        return;
    }

    info!("socks5 {peer}: relaying to {target}");
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

async fn dial(target: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if target.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.connect(target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn negotiate_method_accepts_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut client = client;
        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            reply
        });

        negotiate_method(&mut server).await.unwrap();
    }

    #[tokio::test]
    async fn negotiate_method_rejects_bad_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let result = negotiate_method(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(0x04))));
    }

    #[tokio::test]
    async fn read_request_parses_connect_to_ipv4() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client
            .write_all(&[0x05, CMD_CONNECT, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();

        let (cmd, parsed_addr, port) = read_request(&mut server).await.unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(parsed_addr, Address::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(port, 80);
    }
}
