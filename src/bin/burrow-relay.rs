// Relay broker host.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow::broker::auth::{OpenAccess, StaticTokenValidator, TokenValidator};
use burrow::broker::relay::{serve, RelayBroker};

#[derive(Parser)]
#[command(name = "burrow-relay", about = "Relay broker: fallback data plane for tunnels")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:8001")]
    listen: String,

    /// Accepted bearer token as USER:SECRET (repeatable).
    #[arg(long = "token", value_name = "USER:SECRET")]
    tokens: Vec<String>,

    /// Development mode: accept any token.
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

    let validator: Arc<dyn TokenValidator> = if cli.open {
        tracing::warn!("running in open mode: all tokens accepted");
        Arc::new(OpenAccess)
    } else {
        if cli.tokens.is_empty() {
            bail!("no --token entries given; pass --open for development mode");
        }
        let tokens = cli
            .tokens
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((user, secret)) if !user.is_empty() && !secret.is_empty() => {
                    Ok((secret.to_string(), user.to_string()))
                }
                _ => bail!("expected USER:SECRET, got '{entry}'"),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Arc::new(StaticTokenValidator::new(tokens))
    };

    let (addr, handle) = serve(Arc::new(RelayBroker::new(validator)), &cli.listen)
        .await
        .context("starting relay broker")?;
    tracing::info!("relay broker listening on {addr}");

    handle.await.context("server task")?;
    Ok(())
}
