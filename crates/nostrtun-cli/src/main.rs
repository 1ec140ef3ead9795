//! nostrtun command-line interface.
//!
//! Runs either tunnel endpoint: `client` listens on a local port and
//! forwards through the relays; `server` receives sessions and dials
//! the configured target. Every flag has an environment-variable
//! equivalent with the `NOSTRTUN_` prefix; flags take precedence.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use nostrtun_core::keys::{Keypair, PublicKey};
use nostrtun_core::relay::RelayPool;
use nostrtun_core::tunnel::{
    run_egress, run_ingress, EgressConfig, IngressConfig, TunnelConfig,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Which tunnel endpoint to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Accept local TCP connections and forward them.
    Client,
    /// Receive forwarded sessions and dial the target.
    Server,
}

/// Decentralized TCP tunnel over Nostr-style relays
#[derive(Parser)]
#[command(name = "nostrtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Endpoint role
    #[arg(long, value_enum, env = "NOSTRTUN_MODE")]
    mode: Mode,

    /// Local listening port (client)
    #[arg(long, default_value_t = 8080, env = "NOSTRTUN_CLIENT_PORT")]
    client_port: u16,

    /// Target host to dial (server); may embed the port as host:port
    #[arg(long, default_value = "localhost", env = "NOSTRTUN_TARGET_HOST")]
    target_host: String,

    /// Target port to dial (server); ignored when target-host has a colon
    #[arg(long, default_value_t = 80, env = "NOSTRTUN_TARGET_PORT")]
    target_port: u16,

    /// Server public key, hex or npub (client; required)
    #[arg(long, env = "NOSTRTUN_SERVER_KEY")]
    server_key: Option<String>,

    /// Identity secret key, hex or nsec; generated when absent
    #[arg(long, env = "NOSTRTUN_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Relay URL; repeatable and/or comma-separated
    #[arg(
        long = "relay",
        env = "NOSTRTUN_RELAY",
        value_delimiter = ',',
        default_value = "ws://localhost:10547"
    )]
    relays: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "NOSTRTUN_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let identity = Arc::new(match &cli.private_key {
        Some(secret) => Keypair::from_secret(secret).context("invalid --private-key")?,
        None => Keypair::generate(),
    });

    println!("nostrtun {}", env!("CARGO_PKG_VERSION"));
    println!("Identity public key:");
    println!("  hex:   {}", identity.public().to_hex());
    println!("  bech32: {}", identity.public().to_bech32());

    // Root shutdown: ctrl-c flips the watch, everything drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let pool = RelayPool::connect(&cli.relays)
        .await
        .context("could not reach any relay")?;
    tracing::info!(relays = pool.relay_count(), "relay pool ready");

    match cli.mode {
        Mode::Client => {
            if cli.client_port == 0 {
                bail!("client port must be between 1 and 65535");
            }
            let server_key = cli
                .server_key
                .as_deref()
                .context("--server-key is required in client mode")?;
            let server_key = PublicKey::parse(server_key).context("invalid --server-key")?;

            let config = IngressConfig {
                listen_port: cli.client_port,
                server_key,
                tunnel: TunnelConfig::default(),
            };
            run_ingress(config, identity, pool, shutdown_rx).await?;
        }
        Mode::Server => {
            let (target_host, target_port) = split_target(&cli.target_host, cli.target_port)?;

            println!();
            println!("Share this public key with clients via --server-key");
            println!();

            let config = EgressConfig {
                target_host,
                target_port,
                tunnel: TunnelConfig::default(),
            };
            run_egress(config, identity, pool, shutdown_rx).await?;
        }
    }

    Ok(())
}

/// Resolve the dial target, letting a `host:port` target-host override
/// the separate port flag.
fn split_target(target_host: &str, target_port: u16) -> Result<(String, u16)> {
    if let Some((host, port_text)) = target_host.rsplit_once(':') {
        let port: u16 = port_text
            .parse()
            .ok()
            .filter(|p| *p > 0)
            .with_context(|| format!("invalid port in target host {target_host:?}"))?;
        return Ok((host.to_string(), port));
    }
    if target_host.is_empty() {
        bail!("target host cannot be empty");
    }
    if target_port == 0 {
        bail!("target port must be between 1 and 65535");
    }
    Ok((target_host.to_string(), target_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target_plain_host() {
        let (host, port) = split_target("localhost", 80).expect("split");
        assert_eq!(host, "localhost");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_split_target_with_embedded_port() {
        // The separate port flag is ignored.
        let (host, port) = split_target("example.org:9000", 80).expect("split");
        assert_eq!(host, "example.org");
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_split_target_rejects_bad_input() {
        assert!(split_target("host:notaport", 80).is_err());
        assert!(split_target("host:0", 80).is_err());
        assert!(split_target("", 80).is_err());
        assert!(split_target("host", 0).is_err());
    }
}
