//! Error taxonomy for the proxy engine.
//!
//! Mirrors the error kinds enumerated for the data plane: protocol framing
//! errors, dial failures, stream errors, listener-bind failures, and the
//! forwarder's "not configured" case. The data plane itself never surfaces
//! these as `Result`s to a caller (a stream error just tears down its
//! session) — this enum exists for the setup/lifecycle APIs and for tests
//! that want to assert on *why* a reply code was chosen.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("dial failed: {0}")]
    DialFailure(#[source] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("listener bind failed on {addr}: {source}")]
    ListenerFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("forwarder not configured: remote_host is empty")]
    NotConfigured,
}

/// Malformed or unsupported protocol framing (bad SOCKS5 version, bad ATYP,
/// truncated request, malformed HTTP request line).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("truncated or malformed request")]
    Truncated,

    #[error("malformed HTTP request: {0}")]
    MalformedHttp(String),

    #[error("HTTP request head exceeds 8KiB cap")]
    HeadTooLarge,
}

/// SOCKS5 reply codes used in error replies (RFC 1928 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl fmt::Display for Socks5Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", *self as u8)
    }
}

impl From<&ProtocolError> for Socks5Reply {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::UnsupportedCommand(_) => Socks5Reply::CommandNotSupported,
            ProtocolError::UnsupportedAddressType(_) => Socks5Reply::AddressTypeNotSupported,
            _ => Socks5Reply::GeneralFailure,
        }
    }
}
