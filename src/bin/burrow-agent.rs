// Device-resident tunnel host: keeps the agent alive and exposes the
// login / run / status / logout lifecycle around the settings store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use burrow::settings::{AuthState, JsonSettingsStore, SettingsStore};
use burrow::tunnel::manager::{AgentTunables, TunnelManager};

#[derive(Parser)]
#[command(name = "burrow-agent", about = "Tunnel agent for remote access to local services")]
struct Cli {
    /// Default local upstream to proxy to.
    #[arg(long, default_value = "http://localhost:5142")]
    local_url: String,

    /// Relay broker base URL (fallback data plane).
    #[arg(long, default_value = "ws://localhost:8001")]
    relay_url: String,

    /// Settings directory (defaults to ~/.burrow).
    #[arg(long)]
    settings_dir: Option<PathBuf>,

    /// P2P attempts before relay fallback.
    #[arg(long)]
    max_p2p_attempts: Option<u32>,

    /// Per-attempt P2P deadline in seconds.
    #[arg(long)]
    p2p_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store credentials for this device.
    Login {
        #[arg(long)]
        signaling_url: String,
        /// Generated when omitted.
        #[arg(long)]
        device_id: Option<String>,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        user: String,
    },
    /// Run the tunnel until interrupted.
    Run,
    /// Print tunnel status.
    Status,
    /// Forget stored credentials.
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burrow=info")),
        )
        .init();

    let cli = Cli::parse();
    let store: Arc<dyn SettingsStore> = Arc::new(match &cli.settings_dir {
        Some(dir) => JsonSettingsStore::new(dir),
        None => JsonSettingsStore::default_location(),
    });

    match cli.command {
        Command::Login {
            signaling_url,
            device_id,
            token,
            user,
        } => {
            let device_id =
                device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            store
                .save_auth_state(&AuthState {
                    token,
                    device_id: device_id.clone(),
                    signaling_url,
                    user_handle: user,
                })
                .context("saving credentials")?;
            println!("logged in as device {device_id}");
        }

        Command::Logout => {
            store.clear_auth_state().context("clearing credentials")?;
            println!("logged out");
        }

        Command::Status => {
            let manager = manager_for(&cli, store);
            let status = manager.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Run => {
            let manager = manager_for(&cli, store);
            manager.enable().await.context("starting tunnel")?;

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("interrupt received, shutting down");
            manager.stop().await;
        }
    }

    Ok(())
}

fn manager_for(cli: &Cli, store: Arc<dyn SettingsStore>) -> TunnelManager {
    TunnelManager::new(store, &cli.local_url, &cli.relay_url).with_tunables(AgentTunables {
        max_p2p_attempts: cli.max_p2p_attempts,
        p2p_timeout: cli.p2p_timeout_secs.map(Duration::from_secs),
        reconnect_delay: None,
    })
}
