//! portgate: game-server admission daemon.
//!
//! Keeps a kernel allowlist of client addresses behind a default-deny
//! firewall, runs a TCP/UDP relay to one backend that can be repointed
//! live, and exposes both through an authenticated HTTP control API.

mod api;
mod auth;
mod config;
mod error;
mod firewall;
mod gateway;
mod relay;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::ServerConfig;
use portgate_core::{Address, RelayTarget};
use relay::{RelayInstance, RelayOptions, Transports};
use server::PortgateServer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// portgate: allowlist firewall, live-repointable relay, control API
#[derive(Parser, Debug)]
#[command(name = "portgate", version, about = "Game-server admission daemon")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: firewall baseline, relay, and control API
    Serve {
        /// Config file path
        #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Control API listen address (overrides [api] listen)
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Shared secret for control requests (overrides [api] secret)
        #[arg(long, env = "PORTGATE_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Log packet filter commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single relay in the foreground
    Relay {
        /// Port to listen on
        #[arg(long)]
        listen: u16,

        /// Backend address, `ip:port`
        #[arg(long)]
        remote: SocketAddr,

        /// Local address to bind
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        /// Transports to relay
        #[arg(long, value_enum, default_value_t = RelayProtocol::Both)]
        protocol: RelayProtocol,

        /// Seconds before an idle UDP session is dropped
        #[arg(long, default_value_t = 15)]
        udp_timeout: u64,

        /// Maximum concurrent UDP sessions
        #[arg(long, default_value_t = 200)]
        max_udp_sessions: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RelayProtocol {
    Tcp,
    Udp,
    Both,
}

impl RelayProtocol {
    fn transports(self) -> Transports {
        match self {
            RelayProtocol::Tcp => Transports { tcp: true, udp: false },
            RelayProtocol::Udp => Transports { tcp: false, udp: true },
            RelayProtocol::Both => Transports::BOTH,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Serve {
            config,
            listen,
            secret,
            dry_run,
        } => serve(config, listen, secret, dry_run).await,
        Command::Relay {
            listen,
            remote,
            bind,
            protocol,
            udp_timeout,
            max_udp_sessions,
        } => {
            let target = RelayTarget {
                bind_port: listen,
                backend_address: Address::from(remote.ip()),
                backend_port: remote.port(),
            };
            let options = RelayOptions {
                bind_ip: bind,
                transports: protocol.transports(),
                udp_idle_timeout: Duration::from_secs(udp_timeout.max(1)),
                max_udp_sessions: max_udp_sessions.max(1),
                gate: None,
            };
            run_relay(target, options).await
        }
    }
}

async fn serve(
    config_path: PathBuf,
    listen: Option<SocketAddr>,
    secret: Option<String>,
    dry_run: bool,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting portgate");

    let config = ServerConfig::load(Some(&config_path), listen, secret.as_deref(), dry_run)
        .context("failed to load config")?;
    let server = PortgateServer::new(config).context("failed to build daemon")?;
    server.prepare().await.context("start-up failed")?;
    server
        .run(async {
            shutdown_signal().await;
            info!("received shutdown signal");
        })
        .await
        .context("server error")?;
    Ok(())
}

async fn run_relay(target: RelayTarget, options: RelayOptions) -> Result<()> {
    let instance = RelayInstance::start(target, options)
        .await
        .with_context(|| format!("relay {target} failed to start"))?;
    info!(target = %target, "standalone relay running");

    tokio::select! {
        _ = instance.closed() => {
            info!("relay listener ended");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }
    instance.stop().await;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "cannot install SIGTERM handler, waiting for Ctrl+C only"
                );
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
