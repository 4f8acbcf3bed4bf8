//! SOCKS5 / HTTP proxy and transparent TCP forwarder engine.
//!
//! [`ProxyEngine`] is the public entry point: construct one, call
//! [`ProxyEngine::start`] with an [`EngineConfig`] (and an optional
//! [`ForwarderConfig`]), and observe [`EngineSnapshot`]s via
//! [`ProxyEngine::set_observer`] or by polling [`ProxyEngine::snapshot`].

pub mod config;
pub mod error;
pub mod protocol;
pub mod supervisor;
pub mod system;

pub use config::{EngineConfig, ForwarderConfig, ProxyType, DEFAULT_TCP_PORT, LEGACY_TCP_PORT};
pub use error::{EngineError, ProtocolError, Socks5Reply};
pub use supervisor::{EngineSnapshot, LifecycleState, ProxyEngine, SnapshotObserver};
