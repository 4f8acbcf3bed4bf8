//! Command-line front end for `proxy-core`: configures and drives a
//! [`ProxyEngine`] in-process, printing live traffic snapshots to stdout
//! until interrupted, mirroring the teacher's `router-cli` ergonomics
//! (`clap` derive CLI, `anyhow` top-level error reporting) but talking to
//! the engine directly rather than to an out-of-scope REST admin API.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use proxy_core::{EngineConfig, EngineSnapshot, ForwarderConfig, ProxyEngine, ProxyType};

/// Front end for the SOCKS5 / HTTP proxy and TCP forwarder engine.
#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "CLI front end for the proxy-core engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliProxyType {
    Socks5,
    Http,
}

impl From<CliProxyType> for ProxyType {
    fn from(value: CliProxyType) -> Self {
        match value {
            CliProxyType::Socks5 => ProxyType::Socks5,
            CliProxyType::Http => ProxyType::Http,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SOCKS5 or HTTP proxy listener until interrupted (Ctrl-C).
    Serve {
        /// Which proxy protocol to speak.
        #[arg(long, value_enum, default_value = "socks5")]
        proxy_type: CliProxyType,

        /// TCP port to listen on. In SOCKS5 mode the UDP relay binds one
        /// port above whatever this actually resolves to.
        #[arg(long, default_value_t = proxy_core::DEFAULT_TCP_PORT)]
        tcp_port: u16,

        /// Optional transparent TCP forwarder remote host, run alongside
        /// the proxy listener. Leave unset to run the proxy alone.
        #[arg(long)]
        forward_to: Option<String>,

        /// Forwarder remote port (only meaningful with `--forward-to`).
        #[arg(long, default_value_t = 1194)]
        forward_remote_port: u16,

        /// Forwarder local listen port (only meaningful with
        /// `--forward-to`).
        #[arg(long, default_value_t = 51821)]
        forward_local_port: u16,

        /// Print each snapshot as a JSON object instead of a plain line.
        #[arg(long)]
        json: bool,
    },

    /// Run only the transparent TCP forwarder (`tcp-listen,fork ->
    /// tcp:host:port`) until interrupted.
    Forward {
        /// Remote host to relay every accepted connection to.
        #[arg(long, required = true)]
        remote_host: String,

        #[arg(long, default_value_t = 1194)]
        remote_port: u16,

        #[arg(long, default_value_t = 51821)]
        local_port: u16,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let engine = ProxyEngine::new();

    let (proxy_config, forwarder_config, json) = match cli.command {
        Commands::Serve {
            proxy_type,
            tcp_port,
            forward_to,
            forward_remote_port,
            forward_local_port,
            json,
        } => {
            let proxy_config = EngineConfig::default()
                .with_tcp_port(tcp_port)
                .with_proxy_type(proxy_type.into());
            let forwarder_config = forward_to.map(|remote_host| ForwarderConfig {
                remote_host,
                remote_port: forward_remote_port,
                local_port: forward_local_port,
            });
            (Some(proxy_config), forwarder_config, json)
        }
        Commands::Forward {
            remote_host,
            remote_port,
            local_port,
            json,
        } => {
            let forwarder_config = ForwarderConfig {
                remote_host,
                remote_port,
                local_port,
            };
            (None, Some(forwarder_config), json)
        }
    };

    engine.set_observer(std::sync::Arc::new(move |snapshot: EngineSnapshot| {
        if json {
            if let Ok(line) = serde_json::to_string(&snapshot) {
                println!("{line}");
            }
        } else {
            println!(
                "up {:.3} Mb/s ({} B) / down {:.3} Mb/s ({} B) / clients {}",
                snapshot.upload_mbps,
                snapshot.upload_total,
                snapshot.download_mbps,
                snapshot.download_total,
                snapshot.client_count,
            );
        }
    }));

    engine
        .start(proxy_config, forwarder_config)
        .await
        .context("failed to start proxy engine")?;

    let snap = engine.snapshot();
    if snap.tcp_port != 0 {
        info!(
            "proxy listening on {}:{} (udp {})",
            snap.ip_address, snap.tcp_port, snap.udp_port
        );
    }
    if let Some(addr) = engine.forwarder_addr() {
        info!("tcp forwarder listening on {addr}");
    }

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

    // Give the ticker task's final tick a moment to land before exit, so a
    // `--json` consumer piping this process's stdout sees one last
    // zeroed-counters line (spec §3: lifecycle resets published counters
    // to zero on Stopped).
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
