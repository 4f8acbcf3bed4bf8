//! Proxy supervisor (component I): the engine lifecycle, the main proxy
//! listener (SOCKS5 or HTTP, per configuration), the shared SOCKS5 UDP
//! relay socket, the optional TCP forwarder, and the 1 Hz accounting
//! ticker.
//!
//! Grounded in the teacher's `system::server::init` + per-service spawn
//! loop, but generalized from one-OS-thread-per-service into async tasks
//! supervised from a single `Arc`-shared handle, since the engine must be
//! stoppable from other async code rather than only from a signal handler.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, ForwarderConfig, ProxyType};
use crate::error::EngineError;
use crate::protocol::{http, socks5};
use crate::system::accounting::TrafficAccountant;
use crate::system::forwarder;
use crate::system::interfaces::preferred_lan_ipv4;
use crate::system::registry::ConnectionRegistry;

/// Observer callback invoked once per accounting tick with a fresh
/// snapshot. Held as a trait object so the CLI/UI layer can wire up
/// whatever it likes (printing a line, pushing to a channel) without the
/// engine depending on it.
pub type SnapshotObserver = Arc<dyn Fn(EngineSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Ready,
    Cancelled,
    Failed,
}

/// The engine's observable outputs (spec.md §6): what a CLI printer or an
/// out-of-scope UI layer would poll or receive via [`SnapshotObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub is_running: bool,
    pub ip_address: Ipv4Addr,
    pub tcp_port: u16,
    /// `0` when no UDP relay is bound (HTTP mode, or the forwarder alone).
    pub udp_port: u16,
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_mbps: f64,
    pub download_mbps: f64,
    pub client_count: usize,
}

struct EngineInner {
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
    state: Mutex<LifecycleState>,
    started_at: Mutex<Option<Instant>>,
    /// Re-created fresh on every `start()`, since a `CancellationToken`
    /// latches permanently once cancelled — reusing the same token across a
    /// stop/start cycle would make every listener spawned after a restart
    /// observe itself as already cancelled.
    listener_cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    observer: Mutex<Option<SnapshotObserver>>,
    proxy_addr: Mutex<Option<SocketAddr>>,
    udp_addr: Mutex<Option<SocketAddr>>,
    forwarder_addr: Mutex<Option<SocketAddr>>,
    tick_count: AtomicU64,
}

/// The embeddable proxy engine. Cheaply `Clone`-able (an `Arc` around
/// shared state), mirroring the teacher's `Arc<AtomicBool>` active-state
/// sharing between `main` and its signal handler.
#[derive(Clone)]
pub struct ProxyEngine {
    inner: Arc<EngineInner>,
}

impl Default for ProxyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyEngine {
    pub fn new() -> Self {
        ProxyEngine {
            inner: Arc::new(EngineInner {
                registry: ConnectionRegistry::new(),
                accountant: Arc::new(TrafficAccountant::new()),
                state: Mutex::new(LifecycleState::Idle),
                started_at: Mutex::new(None),
                listener_cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
                observer: Mutex::new(None),
                proxy_addr: Mutex::new(None),
                udp_addr: Mutex::new(None),
                forwarder_addr: Mutex::new(None),
                tick_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_observer(&self, observer: SnapshotObserver) {
        *self.inner.observer.lock().unwrap() = Some(observer);
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock().unwrap()
    }

    /// Starts the main proxy listener and, if `forwarder.remote_host` is
    /// non-empty, the transparent TCP forwarder alongside it. Idempotent:
    /// calling `start` again while already `Ready` or `Starting` is a
    /// no-op. `proxy_config` and `forwarder_config` are independent: pass
    /// `None` for whichever listener this instance shouldn't run. Passing
    /// `None` for both is a [`EngineError::NotConfigured`] error, since an
    /// engine with nothing to listen on has nothing to supervise.
    pub async fn start(
        &self,
        proxy_config: Option<EngineConfig>,
        forwarder_config: Option<ForwarderConfig>,
    ) -> Result<(), EngineError> {
        let forwarder_enabled = forwarder_config
            .as_ref()
            .map(|c| !c.remote_host.is_empty())
            .unwrap_or(false);
        if proxy_config.is_none() && !forwarder_enabled {
            return Err(EngineError::NotConfigured);
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                LifecycleState::Starting | LifecycleState::Ready => return Ok(()),
                _ => *state = LifecycleState::Starting,
            }
        }

        self.inner.accountant.reset();
        *self.inner.started_at.lock().unwrap() = Some(Instant::now());
        // A fresh token per start(): the previous one (if any) is already
        // cancelled from the prior stop() and must not leak into this run.
        *self.inner.listener_cancel.lock().unwrap() = CancellationToken::new();

        if let Some(config) = proxy_config {
            let requested_addr: SocketAddr = format!("0.0.0.0:{}", config.tcp_port)
                .parse()
                .expect("formatted socket address is always valid");

            let listener = match TcpListener::bind(requested_addr).await {
                Ok(listener) => listener,
                Err(source) => {
                    *self.inner.state.lock().unwrap() = LifecycleState::Failed;
                    return Err(EngineError::ListenerFailure {
                        addr: requested_addr.to_string(),
                        source,
                    });
                }
            };
            // `config.tcp_port == 0` asks the OS for an ephemeral port; the
            // pairing guarantee (spec §8: "UDP listener bound at exactly
            // tcp_port + 1") is, absent an explicit `config.udp_port`,
            // computed from the *actual* bound port, not the requested one.
            let bind_addr = listener.local_addr().unwrap_or(requested_addr);
            *self.inner.proxy_addr.lock().unwrap() = Some(bind_addr);

            let udp_socket = if config.proxy_type == ProxyType::Socks5 {
                // `udp_port == 0` means "derive from the actual bound TCP
                // port"; any other value is an explicit override honored
                // verbatim (spec §6: `udp_port` is an independent config
                // input, not always `tcp_port + 1`).
                let udp_port = if config.udp_port != 0 {
                    config.udp_port
                } else {
                    bind_addr.port().wrapping_add(1)
                };
                let udp_bind_addr: SocketAddr = format!("0.0.0.0:{udp_port}")
                    .parse()
                    .expect("formatted socket address is always valid");
                let socket = match UdpSocket::bind(udp_bind_addr).await {
                    Ok(socket) => socket,
                    Err(source) => {
                        *self.inner.state.lock().unwrap() = LifecycleState::Failed;
                        return Err(EngineError::ListenerFailure {
                            addr: udp_bind_addr.to_string(),
                            source,
                        });
                    }
                };
                let actual = socket.local_addr().unwrap_or(udp_bind_addr);
                *self.inner.udp_addr.lock().unwrap() = Some(actual);
                Some(Arc::new(socket))
            } else {
                *self.inner.udp_addr.lock().unwrap() = None;
                None
            };

            if let Some(udp_socket) = udp_socket.clone() {
                let accountant = self.inner.accountant.clone();
                let cancel = self.inner.listener_cancel.lock().unwrap().clone();
                let relay_task =
                    tokio::spawn(async move { socks5::udp::serve_relay(udp_socket, accountant, cancel).await });
                self.inner.tasks.lock().unwrap().push(relay_task);
            }

            let registry = self.inner.registry.clone();
            let accountant = self.inner.accountant.clone();
            let cancel = self.inner.listener_cancel.lock().unwrap().clone();
            let proxy_type = config.proxy_type;
            // The reply to `UDP ASSOCIATE` carries the LAN-facing IPv4 the
            // upper layer would publish, not `0.0.0.0` (spec §4.H step 1).
            let udp_relay_addr = udp_socket
                .as_ref()
                .map(|s| SocketAddr::new(preferred_lan_ipv4().into(), s.local_addr().map(|a| a.port()).unwrap_or(0)));

            let proxy_task = tokio::spawn(async move {
                if let Err(e) = serve_proxy(
                    listener,
                    bind_addr,
                    proxy_type,
                    registry,
                    accountant,
                    cancel,
                    udp_relay_addr,
                )
                .await
                {
                    warn!("proxy listener on {bind_addr} exited: {e}");
                }
            });
            self.inner.tasks.lock().unwrap().push(proxy_task);
        } else {
            *self.inner.proxy_addr.lock().unwrap() = None;
            *self.inner.udp_addr.lock().unwrap() = None;
        }

        if let Some(fwd_config) = forwarder_config {
            if !fwd_config.remote_host.is_empty() {
                let forwarder_addr: SocketAddr =
                    format!("0.0.0.0:{}", fwd_config.local_port).parse().unwrap();
                *self.inner.forwarder_addr.lock().unwrap() = Some(forwarder_addr);

                let registry = self.inner.registry.clone();
                let accountant = self.inner.accountant.clone();
                let cancel = self.inner.listener_cancel.lock().unwrap().clone();
                let fwd_task = tokio::spawn(async move {
                    if let Err(e) = forwarder::serve(fwd_config, registry, accountant, cancel).await {
                        warn!("tcp forwarder exited: {e}");
                    }
                });
                self.inner.tasks.lock().unwrap().push(fwd_task);
            }
        }

        let ticker_engine = self.clone();
        let ticker_task = tokio::spawn(async move { ticker_engine.run_ticker().await });
        self.inner.tasks.lock().unwrap().push(ticker_task);

        *self.inner.state.lock().unwrap() = LifecycleState::Ready;
        info!("proxy engine ready");
        Ok(())
    }

    /// Cancels every listener and in-flight connection, then waits for the
    /// spawned tasks to wind down. Idempotent: stopping an already-stopped
    /// engine is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != LifecycleState::Ready && *state != LifecycleState::Starting {
                return;
            }
            *state = LifecycleState::Cancelled;
        }

        self.inner.listener_cancel.lock().unwrap().cancel();
        self.inner.registry.close_all();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        *self.inner.proxy_addr.lock().unwrap() = None;
        *self.inner.udp_addr.lock().unwrap() = None;
        *self.inner.forwarder_addr.lock().unwrap() = None;
        self.inner.accountant.reset();
        info!("proxy engine stopped");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let traffic = self.inner.accountant.snapshot();
        let tcp_port = self
            .inner
            .proxy_addr
            .lock()
            .unwrap()
            .map(|a| a.port())
            .unwrap_or(0);
        let udp_port = self.inner.udp_addr.lock().unwrap().map(|a| a.port()).unwrap_or(0);

        EngineSnapshot {
            is_running: self.state() == LifecycleState::Ready,
            ip_address: preferred_lan_ipv4(),
            tcp_port,
            udp_port,
            upload_total: traffic.upload_total,
            download_total: traffic.download_total,
            upload_mbps: traffic.upload_mbps,
            download_mbps: traffic.download_mbps,
            client_count: self.inner.registry.inbound_count(),
        }
    }

    /// Wall-clock time since the last successful `start()`, `0` if never
    /// started. Kept separate from [`EngineSnapshot`] (spec.md §6 does not
    /// list uptime among the observable outputs) but exposed for CLI/UI
    /// layers that want it.
    pub fn uptime_secs(&self) -> u64 {
        self.inner
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn forwarder_addr(&self) -> Option<SocketAddr> {
        *self.inner.forwarder_addr.lock().unwrap()
    }

    async fn run_ticker(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                _ = self.inner.listener_cancel.lock().unwrap().clone().cancelled() => return,
                _ = interval.tick() => {
                    self.inner.accountant.tick();
                    self.inner.tick_count.fetch_add(1, Ordering::Relaxed);
                    let snapshot = self.snapshot();
                    if let Some(observer) = self.inner.observer.lock().unwrap().clone() {
                        observer(snapshot);
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_proxy(
    listener: TcpListener,
    bind_addr: SocketAddr,
    proxy_type: ProxyType,
    registry: Arc<ConnectionRegistry>,
    accountant: Arc<TrafficAccountant>,
    cancel: CancellationToken,
    udp_relay_addr: Option<SocketAddr>,
) -> Result<(), EngineError> {
    info!("{proxy_type:?} proxy listening on {bind_addr}");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("{proxy_type:?} proxy on {bind_addr} shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("{proxy_type:?} proxy accept error: {e}");
                        continue;
                    }
                };
                let registry = registry.clone();
                let accountant = accountant.clone();
                match proxy_type {
                    ProxyType::Socks5 => {
                        tokio::spawn(async move {
                            socks5::tcp::handle_connection(stream, peer, registry, accountant, udp_relay_addr).await;
                        });
                    }
                    ProxyType::Http => {
                        tokio::spawn(async move {
                            http::handle_connection(stream, peer, registry, accountant).await;
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let engine = ProxyEngine::new();
        let config = EngineConfig::default().with_tcp_port(0);
        engine.start(Some(config), None).await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Ready);

        // calling start again while already ready is a no-op, not an error
        let config2 = EngineConfig::default().with_tcp_port(0);
        engine.start(Some(config2), None).await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Ready);

        engine.stop().await;
        assert_eq!(engine.state(), LifecycleState::Cancelled);
        engine.stop().await; // no-op, must not panic
    }

    #[tokio::test]
    async fn snapshot_reports_zero_traffic_after_start() {
        let engine = ProxyEngine::new();
        let config = EngineConfig::default().with_tcp_port(0);
        engine.start(Some(config), None).await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.upload_total, 0);
        assert_eq!(snap.download_total, 0);
        assert!(snap.is_running);
        engine.stop().await;
    }

    #[tokio::test]
    async fn udp_relay_is_bound_one_above_the_actual_tcp_port() {
        let engine = ProxyEngine::new();
        let config = EngineConfig::default()
            .with_tcp_port(0)
            .with_proxy_type(ProxyType::Socks5);
        engine.start(Some(config), None).await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.udp_port, snap.tcp_port.wrapping_add(1));
        engine.stop().await;
    }

    #[tokio::test]
    async fn explicit_udp_port_override_is_honored() {
        // Bind an ephemeral port first just to find a free one to pin to.
        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pinned_port = probe.local_addr().unwrap().port();
        drop(probe);

        let engine = ProxyEngine::new();
        let config = EngineConfig::default()
            .with_tcp_port(0)
            .with_proxy_type(ProxyType::Socks5)
            .with_udp_port(pinned_port);
        engine.start(Some(config), None).await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.udp_port, pinned_port);
        // An explicit override need not be tcp_port + 1.
        assert_ne!(snap.udp_port, snap.tcp_port.wrapping_add(1));
        engine.stop().await;
    }

    #[tokio::test]
    async fn http_mode_binds_no_udp_relay() {
        let engine = ProxyEngine::new();
        let config = EngineConfig::default()
            .with_tcp_port(0)
            .with_proxy_type(ProxyType::Http);
        engine.start(Some(config), None).await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.udp_port, 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn engine_accepts_connections_again_after_a_stop_start_cycle() {
        // Regression test: the listener's cancellation token must be fresh
        // on every start(), or a second run inherits an already-cancelled
        // token from the first stop() and its listener loop exits instantly.
        let engine = ProxyEngine::new();
        let config = EngineConfig::default().with_tcp_port(0);
        engine.start(Some(config), None).await.unwrap();
        let first_port = engine.snapshot().tcp_port;
        engine.stop().await;
        assert_eq!(engine.state(), LifecycleState::Cancelled);

        let config2 = EngineConfig::default().with_tcp_port(0);
        engine.start(Some(config2), None).await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Ready);
        let second_port = engine.snapshot().tcp_port;

        let addr: SocketAddr = format!("127.0.0.1:{second_port}").parse().unwrap();
        tokio::net::TcpStream::connect(addr)
            .await
            .expect("listener from the second start() must accept connections");

        engine.stop().await;
        let _ = first_port;
    }
}
