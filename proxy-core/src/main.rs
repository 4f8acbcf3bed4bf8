//! Thin standalone binary wrapping [`proxy_core::ProxyEngine`] with
//! environment-driven configuration and a SIGINT handler. Most users reach
//! the engine through `proxy-cli`; this binary is for running a SOCKS5
//! proxy with zero setup.

use std::sync::mpsc;

use anyhow::Context;
use log::info;
use proxy_core::{EngineConfig, ProxyEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let tcp_port: u16 = std::env::var("PROXY_TCP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(proxy_core::DEFAULT_TCP_PORT);

    let config = EngineConfig::default().with_tcp_port(tcp_port);

    let engine = ProxyEngine::new();
    engine
        .start(Some(config.clone()), None)
        .await
        .with_context(|| format!("failed to start proxy engine on port {}", config.tcp_port))?;

    info!("proxy engine listening on port {}", config.tcp_port);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install SIGINT handler")?;

    tokio::task::spawn_blocking(move || rx.recv())
        .await
        .context("signal-wait task panicked")?
        .context("signal channel closed unexpectedly")?;

    info!("shutdown signal received, stopping engine");
    engine.stop().await;
    Ok(())
}
