// Transport facade — wraps either a WebRTC data channel or a relayed
// WebSocket connection behind one send interface.
//
// The supervisor owns every state mutation; everything else sees the
// transport through this enum or the shared outbound channel.

use std::sync::Arc;

use serde::Serialize;

use crate::error::AppResult;
use crate::network::relay::RelayTransport;
use crate::network::webrtc::WebRtcTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    P2p,
    Relay,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::P2p => "p2p",
            TransportMode::Relay => "relay",
        }
    }
}

/// The live transport carrying multiplex frames for the agent.
pub enum ActiveTransport {
    P2p(Arc<WebRtcTransport>),
    Relay(Arc<RelayTransport>),
}

impl ActiveTransport {
    pub fn mode(&self) -> TransportMode {
        match self {
            ActiveTransport::P2p(_) => TransportMode::P2p,
            ActiveTransport::Relay(_) => TransportMode::Relay,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, ActiveTransport::Relay(_))
    }

    /// Send one multiplex frame to the remote peer.
    pub async fn send(&self, data: Vec<u8>) -> AppResult<()> {
        match self {
            ActiveTransport::P2p(t) => t.send(data).await,
            ActiveTransport::Relay(t) => t.send(data).await,
        }
    }

    pub async fn close(&self) {
        match self {
            ActiveTransport::P2p(t) => t.close().await,
            ActiveTransport::Relay(t) => t.close().await,
        }
    }
}
