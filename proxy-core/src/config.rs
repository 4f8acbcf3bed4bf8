//! Configuration structures for the proxy engine and the TCP forwarder.
//!
//! These are plain, serializable value types. Persistence (writing them to
//! disk, syncing them from a preference store) is a concern of the upper
//! layer that owns this engine, not of the core — see spec §1 (out of
//! scope: persisted user preferences, VPN config-file templating).

use serde::{Deserialize, Serialize};

/// Which proxy protocol the supervisor's TCP listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    Socks5,
    Http,
}

/// Default TCP port for SOCKS5/HTTP proxy mode.
pub const DEFAULT_TCP_PORT: u16 = 4884;
/// Legacy port accepted for backward compatibility with older clients.
pub const LEGACY_TCP_PORT: u16 = 1080;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub proxy_type: ProxyType,
    pub tcp_port: u16,
    /// UDP relay port. Only meaningful when `proxy_type == Socks5`. `0` asks
    /// the engine to derive it as `tcp_port + 1` from the *actual* bound TCP
    /// port (the right choice when `tcp_port` is itself `0`, i.e. "any
    /// ephemeral port"); any nonzero value is honored verbatim as the UDP
    /// relay's bind port instead.
    pub udp_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            proxy_type: ProxyType::Socks5,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self
    }

    pub fn with_proxy_type(mut self, proxy_type: ProxyType) -> Self {
        self.proxy_type = proxy_type;
        self
    }

    /// Pins the UDP relay to an exact port instead of deriving it from
    /// `tcp_port + 1`. Pass `0` to restore the derived default.
    pub fn with_udp_port(mut self, udp_port: u16) -> Self {
        self.udp_port = udp_port;
        self
    }
}

/// Configuration for the standalone transparent TCP forwarder
/// (`tcp-listen,fork -> tcp:host:port`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            remote_host: String::new(),
            remote_port: 1194,
            local_port: 51821,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_udp_port_is_zero_meaning_derive_from_tcp_port() {
        assert_eq!(EngineConfig::default().udp_port, 0);
    }

    #[test]
    fn with_tcp_port_does_not_disturb_an_explicit_udp_port() {
        let config = EngineConfig::default()
            .with_udp_port(9999)
            .with_tcp_port(4884);
        assert_eq!(config.udp_port, 9999);
    }
}
