//! Transparent TCP forwarder (component E).
//!
//! A fixed single-peer relay: everything accepted on `local_port` is dialed
//! straight through to `remote_host:remote_port`, with no protocol framing
//! of its own. Grounded in the teacher's fast single-peer path
//! (`proxy_service_fast` / `ProxyApp` in `app::proxy_fast`), generalized
//! from a fixed compiled-in peer to a configurable one and from the
//! teacher's pingora `ServerApp` to a plain accept loop so it can be
//! started and stopped from async code.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ForwarderConfig;
use crate::error::EngineError;

use super::accounting::{TrafficAccountant, TrafficTag};
use super::pump::relay_tcp;
use super::registry::{ConnectionRegistry, Direction};

/// Runs the forwarder's accept loop until `cancel` fires. Returns
/// immediately with [`EngineError::NotConfigured`] if `remote_host` is
/// empty, since a forwarder with no peer has nothing to relay to.
pub async fn serve(
    config: ForwarderConfig,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    if config.remote_host.is_empty() {
        return Err(EngineError::NotConfigured);
    }

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.local_port)
        .parse()
        .expect("formatted socket address is always valid");

    let listener =
        TcpListener::bind(bind_addr)
            .await
            .map_err(|source| EngineError::ListenerFailure {
                addr: bind_addr.to_string(),
                source,
            })?;

    info!(
        "tcp forwarder listening on {} -> {}:{}",
        bind_addr, config.remote_host, config.remote_port
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("tcp forwarder on {} shutting down", bind_addr);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (inbound, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("tcp forwarder accept error: {e}");
                        continue;
                    }
                };
                spawn_session(inbound, peer, config.clone(), registry.clone(), accountant.clone());
            }
        }
    }
}

fn spawn_session(
    inbound: TcpStream,
    peer: SocketAddr,
    config: ForwarderConfig,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
) {
    tokio::spawn(async move {
        let conn = registry.register(Direction::Inbound);
        let cancel = conn.cancel_token();

        match dial_remote(config.local_port, &config.remote_host, config.remote_port).await {
            Ok(outbound) => {
                info!(
                    "tcp forwarder relaying {} -> {}:{}",
                    peer, config.remote_host, config.remote_port
                );
                // Both directions count as Upload: a forwarder has no
                // client/server asymmetry to label (spec §9).
                relay_tcp(
                    inbound,
                    outbound,
                    TrafficTag::Upload,
                    TrafficTag::Upload,
                    accountant,
                    cancel,
                )
                .await;
            }
            Err(e) => {
                warn!(
                    "tcp forwarder dial to {}:{} failed: {e}",
                    config.remote_host, config.remote_port
                );
            }
        }
        drop(conn);
    });
}

/// Dials the remote peer from a socket bound to the same local port the
/// forwarder listens on, so hairpin NAT setups see a consistent endpoint.
async fn dial_remote(
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> std::io::Result<TcpStream> {
    let remote_addr = lookup_host((remote_host, remote_port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {remote_host}"),
            )
        })?;

    let socket = if remote_addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.set_reuseaddr(true)?;
    let local_addr: SocketAddr = if remote_addr.is_ipv6() {
        format!("[::]:{local_port}").parse().unwrap()
    } else {
        format!("0.0.0.0:{local_port}").parse().unwrap()
    };
    socket.bind(local_addr)?;
    socket.connect(remote_addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serve_rejects_empty_remote_host() {
        let registry = ConnectionRegistry::new();
        let accountant = Arc::new(TrafficAccountant::new());
        let cancel = CancellationToken::new();
        let config = ForwarderConfig {
            remote_host: String::new(),
            remote_port: 1194,
            local_port: 0,
        };

        let result = serve(config, registry, accountant, cancel).await;
        assert!(matches!(result, Err(EngineError::NotConfigured)));
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let registry = ConnectionRegistry::new();
        let accountant = Arc::new(TrafficAccountant::new());
        let cancel = CancellationToken::new();
        let config = ForwarderConfig {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 1,
            local_port: 0,
        };

        let cancel2 = cancel.clone();
        let handle = tokio::spawn(serve(config, registry, accountant, cancel2));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
