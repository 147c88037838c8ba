// Host-facing tunnel lifecycle.
//
// Wraps the agent for the host process: start on boot or login when
// credentials exist, stop on logout or shutdown, report status. Credentials
// come from the settings store; nothing else persists.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::network::transport::{ConnectionState, TransportMode};
use crate::settings::SettingsStore;
use crate::tunnel::agent::{AgentConfig, TunnelAgent};

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    /// offline | connecting | connected | failed
    pub mode: &'static str,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_channel_state: Option<String>,
}

/// Optional overrides applied to every agent the manager creates.
#[derive(Clone, Default)]
pub struct AgentTunables {
    pub max_p2p_attempts: Option<u32>,
    pub p2p_timeout: Option<Duration>,
    pub reconnect_delay: Option<Duration>,
}

pub struct TunnelManager {
    settings: Arc<dyn SettingsStore>,
    local_server_url: String,
    relay_url: String,
    tunables: AgentTunables,
    agent: Mutex<Option<Arc<TunnelAgent>>>,
}

impl TunnelManager {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        local_server_url: impl Into<String>,
        relay_url: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            local_server_url: local_server_url.into(),
            relay_url: relay_url.into(),
            tunables: AgentTunables::default(),
            agent: Mutex::new(None),
        }
    }

    pub fn with_tunables(mut self, tunables: AgentTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Start the agent if credentials are stored. Called on host startup and
    /// after login; a no-op when already running or not authenticated.
    pub async fn start(&self) -> AppResult<()> {
        let mut slot = self.agent.lock().await;
        if let Some(agent) = slot.as_ref() {
            if agent.state() != ConnectionState::Disconnected {
                info!("tunnel already running");
                return Ok(());
            }
        }

        let Some(auth) = self.settings.load_auth_state()? else {
            info!("no stored credentials, tunnel not started");
            return Ok(());
        };

        let mut cfg = AgentConfig::new(
            signal_ws_url(&auth.signaling_url),
            &self.relay_url,
            &auth.device_id,
            &auth.token,
            &self.local_server_url,
        );
        if let Some(attempts) = self.tunables.max_p2p_attempts {
            cfg.max_p2p_attempts = attempts;
        }
        if let Some(timeout) = self.tunables.p2p_timeout {
            cfg.p2p_timeout = timeout;
        }
        if let Some(delay) = self.tunables.reconnect_delay {
            cfg.reconnect_delay = delay;
        }

        info!(
            "starting tunnel agent: device {} as {}",
            auth.device_id, auth.user_handle
        );
        let agent = Arc::new(TunnelAgent::new(cfg)?);
        agent.start().await?;
        *slot = Some(agent);
        Ok(())
    }

    /// Stop the agent. Called on shutdown, logout, or explicit disable.
    pub async fn stop(&self) {
        let agent = self.agent.lock().await.take();
        match agent {
            Some(agent) => {
                agent.stop().await;
                info!("tunnel stopped");
            }
            None => info!("tunnel not running"),
        }
    }

    /// Like start, but missing credentials are an error.
    pub async fn enable(&self) -> AppResult<()> {
        if self.settings.load_auth_state()?.is_none() {
            return Err(AppError::NotAuthenticated);
        }
        self.start().await
    }

    pub async fn disable(&self) {
        self.stop().await;
    }

    pub async fn status(&self) -> TunnelStatus {
        let auth = self.settings.load_auth_state().ok().flatten();
        let authenticated = auth.is_some();
        let device_id = auth.map(|a| a.device_id);

        let agent = self.agent.lock().await.clone();
        let Some(agent) = agent else {
            return TunnelStatus {
                mode: "offline",
                authenticated,
                transport: None,
                device_id,
                data_channel_state: None,
            };
        };

        let mode = match agent.state() {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected | ConnectionState::Closed => "offline",
        };
        TunnelStatus {
            mode,
            authenticated,
            transport: agent.transport_mode().await,
            device_id,
            data_channel_state: agent.data_channel_state().await,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.agent
            .lock()
            .await
            .as_ref()
            .is_some_and(|agent| agent.is_connected())
    }
}

/// Normalize the stored signaling base URL into the /signal ws endpoint.
fn signal_ws_url(url: &str) -> String {
    let mut out = url.trim_end_matches('/').to_string();
    if let Some(rest) = out.strip_prefix("https://") {
        out = format!("wss://{rest}");
    } else if let Some(rest) = out.strip_prefix("http://") {
        out = format!("ws://{rest}");
    }
    if !out.ends_with("/signal") {
        out.push_str("/signal");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AuthState, MemorySettingsStore};

    fn stored_auth() -> AuthState {
        AuthState {
            token: "tok".into(),
            // Nothing listens on port 9; the agent will cycle in failed.
            device_id: "dev-1".into(),
            signaling_url: "http://127.0.0.1:9".into(),
            user_handle: "alice".into(),
        }
    }

    fn fast_tunables() -> AgentTunables {
        AgentTunables {
            max_p2p_attempts: Some(0),
            p2p_timeout: Some(Duration::from_millis(100)),
            reconnect_delay: Some(Duration::from_millis(50)),
        }
    }

    #[test]
    fn signal_url_normalization() {
        assert_eq!(
            signal_ws_url("https://cloud.example"),
            "wss://cloud.example/signal"
        );
        assert_eq!(
            signal_ws_url("http://localhost:8000/"),
            "ws://localhost:8000/signal"
        );
        assert_eq!(
            signal_ws_url("ws://localhost:8000/signal"),
            "ws://localhost:8000/signal"
        );
    }

    #[tokio::test]
    async fn enable_without_credentials_fails() {
        let manager = TunnelManager::new(
            Arc::new(MemorySettingsStore::new()),
            "http://127.0.0.1:9",
            "ws://127.0.0.1:9",
        );
        assert!(matches!(
            manager.enable().await,
            Err(AppError::NotAuthenticated)
        ));

        let status = manager.status().await;
        assert_eq!(status.mode, "offline");
        assert!(!status.authenticated);
    }

    #[tokio::test]
    async fn start_without_credentials_is_a_noop() {
        let manager = TunnelManager::new(
            Arc::new(MemorySettingsStore::new()),
            "http://127.0.0.1:9",
            "ws://127.0.0.1:9",
        );
        manager.start().await.unwrap();
        assert_eq!(manager.status().await.mode, "offline");
    }

    #[tokio::test]
    async fn start_and_stop_with_credentials() {
        let store = Arc::new(MemorySettingsStore::with_auth_state(stored_auth()));
        let manager = TunnelManager::new(store, "http://127.0.0.1:9", "ws://127.0.0.1:9")
            .with_tunables(fast_tunables());

        manager.start().await.unwrap();

        // The supervisor flips out of offline moments after start.
        let mut mode = "offline";
        for _ in 0..100 {
            let status = manager.status().await;
            assert!(status.authenticated);
            assert_eq!(status.device_id.as_deref(), Some("dev-1"));
            if status.mode != "offline" {
                mode = status.mode;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(mode, "offline");

        manager.stop().await;
        assert_eq!(manager.status().await.mode, "offline");
    }
}
