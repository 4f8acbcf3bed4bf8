//! SOCKS5 `UDP ASSOCIATE` relay (component H).
//!
//! There is exactly one UDP relay socket per engine, bound at engine start
//! on `tcp_port + 1` (spec §3, §4.H) and shared across every association —
//! it is not materialised per-session. [`serve_relay`] owns that socket and
//! runs for the engine's lifetime; [`handle_associate`] only answers the
//! `UDP ASSOCIATE` request on one control connection and then blocks on
//! that connection to detect its closure, which is this engine's sole
//! teardown trigger for the association (spec §9: no additional timeout on
//! the control channel).
//!
//! Each inbound client datagram gets its own short-lived outbound
//! "responder" socket, reclaimed after 30 seconds of silence from its
//! target — there is no persistent NAT table, since datagrams are handled
//! independently with no ordering guarantee across packets (spec §4.H, §5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::Socks5Reply;
use crate::protocol::address::Address;
use crate::system::accounting::TrafficAccountant;
use crate::system::registry::{ConnectionRegistry, Direction};

use super::tcp::send_reply;

const RESPONDER_IDLE: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 65_536;

/// Answers one `UDP ASSOCIATE` request with `bound` (the engine's single
/// LAN-IPv4/`udp_port` relay address) and then keeps the control
/// connection open, discarding any bytes on it, until it closes or errors.
pub async fn handle_associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    bound: SocketAddr,
) {
    if send_reply(&mut stream, Socks5Reply::Success, Some(bound))
        .await
        .is_err()
    {
        return;
    }

    info!("socks5 {peer}: udp associate bound on {bound}");

    let conn = registry.register(Direction::Inbound);
    let cancel = conn.cancel_token();

    let mut control_buf = [0u8; 256];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = stream.read(&mut control_buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        debug!("socks5 {peer}: control connection closed, tearing down udp associate");
                        break;
                    }
                    // The control connection carries no application data
                    // once associated; any bytes on it are simply discarded.
                    Ok(_) => continue,
                }
            }
        }
    }

    drop(conn);
}

/// Runs the engine-wide UDP relay loop on `relay_socket` until `cancel`
/// fires. One task per engine instance, shared by every association.
pub async fn serve_relay(
    relay_socket: Arc<UdpSocket>,
    accountant: Arc<TrafficAccountant>,
    cancel: CancellationToken,
) {
    let mut udp_buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            recv = relay_socket.recv_from(&mut udp_buf) => {
                let (n, src) = match recv {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("udp relay recv error: {e}");
                        continue;
                    }
                };
                // "Record len(datagram) as download (arriving at the
                // proxy)" (spec §4.H step 2) applies to every datagram
                // reaching the relay socket, parseable or not.
                accountant.record_down(n);
                spawn_responder(udp_buf[..n].to_vec(), relay_socket.clone(), src, accountant.clone());
            }
        }
    }
}

/// Parses one client datagram's SOCKS5 UDP header and, if well-formed,
/// forwards the payload to its target and relays responses back for up to
/// [`RESPONDER_IDLE`] of target silence.
fn spawn_responder(
    datagram: Vec<u8>,
    relay_socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    accountant: Arc<TrafficAccountant>,
) {
    tokio::spawn(async move {
        if datagram.len() < 4 {
            return;
        }
        let frag = datagram[2];
        if frag != 0 {
            // fragmentation is not supported; drop silently per spec §4.H.
            return;
        }
        let (addr, port, header_len) = match Address::parse_with_port(&datagram[3..]) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };
        let payload = &datagram[3 + header_len..];

        let target = match addr.resolve(port).await {
            Ok(target) => target,
            Err(_) => return,
        };

        let responder = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(_) => return,
        };
        if responder.send_to(payload, target).await.is_err() {
            return;
        }
        accountant.record_up(payload.len());

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match timeout(RESPONDER_IDLE, responder.recv_from(&mut buf)).await {
                Ok(Ok((n, _from))) => {
                    accountant.record_down(n);
                    // Echo the *original* request's ATYP/DST.ADDR/DST.PORT
                    // (spec §4.H step 5), not the response's actual source —
                    // a `SocketAddr` has no domain form, so building this
                    // from the response would silently downgrade an
                    // ATYP=Domain request to V4/V6 in the reply.
                    let mut out = vec![0x00, 0x00, 0x00];
                    addr.encode_with_port(port, &mut out);
                    out.extend_from_slice(&buf[..n]);
                    let _ = relay_socket.send_to(&out, client_addr).await;
                }
                _ => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_forwards_payload_to_target() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let relay = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let fake_client_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let mut datagram = vec![0x00, 0x00, 0x00];
        let addr = Address::V4(match target_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        });
        addr.encode_with_port(target_addr.port(), &mut datagram);
        datagram.extend_from_slice(b"ping");

        let accountant = Arc::new(TrafficAccountant::new());
        spawn_responder(datagram, relay, fake_client_addr, accountant);

        let mut buf = [0u8; 512];
        let (n, _) = timeout(Duration::from_secs(2), target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn serve_relay_round_trips_through_shared_socket() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let relay = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = relay.local_addr().unwrap();
        let accountant = Arc::new(TrafficAccountant::new());
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(serve_relay(relay.clone(), accountant.clone(), cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0x00, 0x00, 0x00];
        let addr = Address::V4(match target_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        });
        addr.encode_with_port(target_addr.port(), &mut datagram);
        datagram.extend_from_slice(b"hello");
        client.send_to(&datagram, relay_addr).await.unwrap();

        let mut target_buf = [0u8; 512];
        let (n, from) = timeout(Duration::from_secs(2), target.recv_from(&mut target_buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&target_buf[..n], b"hello");

        target.send_to(b"world", from).await.unwrap();

        let mut client_buf = [0u8; 512];
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut client_buf))
            .await
            .unwrap()
            .unwrap();
        let (reply_addr, reply_port, header_len) =
            Address::parse_with_port(&client_buf[3..n]).unwrap();
        let expected_addr = match target_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        assert_eq!(reply_addr, Address::V4(expected_addr));
        assert_eq!(reply_port, target_addr.port());
        assert_eq!(&client_buf[3 + header_len..n], b"world");

        cancel.cancel();
        relay_task.await.unwrap();
    }

    #[test]
    fn fragmented_datagrams_are_rejected_by_frag_check() {
        // FRAG byte (index 2) non-zero must be dropped before any parsing.
        let datagram = vec![0x00, 0x00, 0x01, 0x01, 127, 0, 0, 1, 0, 80];
        assert_ne!(datagram[2], 0);
    }
}
