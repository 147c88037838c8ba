// Signaling broker host.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow::broker::auth::{
    DeviceDirectory, OpenAccess, StaticDeviceDirectory, StaticTokenValidator, TokenValidator,
};
use burrow::broker::signal::{serve, SignalBroker};

#[derive(Parser)]
#[command(name = "burrow-signal", about = "Signaling broker for tunnel rendezvous")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: String,

    /// Relay broker URL advertised to peers.
    #[arg(long)]
    relay_url: Option<String>,

    /// Accepted bearer token as USER:SECRET (repeatable).
    #[arg(long = "token", value_name = "USER:SECRET")]
    tokens: Vec<String>,

    /// Device ownership as DEVICE:USER (repeatable).
    #[arg(long = "device", value_name = "DEVICE:USER")]
    devices: Vec<String>,

    /// Development mode: accept any token and any device.
    #[arg(long)]
    open: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burrow=info")),
        )
        .init();

    let cli = Cli::parse();

    let (validator, directory): (Arc<dyn TokenValidator>, Arc<dyn DeviceDirectory>) = if cli.open {
        tracing::warn!("running in open mode: all tokens and devices accepted");
        (Arc::new(OpenAccess), Arc::new(OpenAccess))
    } else {
        if cli.tokens.is_empty() {
            bail!("no --token entries given; pass --open for development mode");
        }
        let tokens = cli
            .tokens
            .iter()
            .map(|entry| parse_pair(entry, "USER:SECRET").map(|(user, secret)| (secret, user)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let devices = cli
            .devices
            .iter()
            .map(|entry| parse_pair(entry, "DEVICE:USER"))
            .collect::<anyhow::Result<Vec<_>>>()?;
        (
            Arc::new(StaticTokenValidator::new(tokens)),
            Arc::new(StaticDeviceDirectory::new(devices)),
        )
    };

    let mut broker = SignalBroker::new(validator, directory);
    if let Some(relay_url) = cli.relay_url {
        broker = broker.with_relay_url(relay_url);
    }

    let (addr, handle) = serve(Arc::new(broker), &cli.listen)
        .await
        .context("starting signal broker")?;
    tracing::info!("signal broker listening on {addr}");

    handle.await.context("server task")?;
    Ok(())
}

fn parse_pair(entry: &str, shape: &str) -> anyhow::Result<(String, String)> {
    match entry.split_once(':') {
        Some((left, right)) if !left.is_empty() && !right.is_empty() => {
            Ok((left.to_string(), right.to_string()))
        }
        _ => bail!("expected {shape}, got '{entry}'"),
    }
}
