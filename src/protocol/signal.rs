// Signaling control messages — typed JSON exchanged via the signaling broker.
//
// The discriminator is the `type` field. SDP and ICE payloads stay opaque
// (`serde_json::Value`): the broker never inspects them and the agent hands
// them straight to the peer connection. Unknown discriminators fail to parse
// rather than being silently ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on one encoded signaling message. The broker rejects anything
/// larger without closing the connection.
pub const MAX_SIGNAL_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    Webrtc,
    Relay,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    Webrtc,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// SDP offer, relayed peer-to-peer. `payload` is the raw session description.
    Offer {
        target_device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: Value,
    },

    /// SDP answer, relayed peer-to-peer.
    Answer {
        target_device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: Value,
    },

    /// Trickle ICE candidate, relayed peer-to-peer.
    IceCandidate {
        target_device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: Value,
    },

    /// Peer asks to connect, stating its transport preference.
    ConnectRequest {
        target_device_id: String,
        #[serde(default)]
        preferred_transport: TransportPreference,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
    },

    /// Broker-rewritten form of `connect-request` delivered to the target.
    ConnectRequestReceived {
        from_device_id: String,
        preferred_transport: TransportPreference,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_url: Option<String>,
    },

    /// Target confirms (or refuses) a connection request.
    ConnectAck {
        target_device_id: String,
        transport: TransportChoice,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
    },

    /// Broker-rewritten form of `connect-ack` delivered to the requester.
    ConnectAckReceived {
        from_device_id: String,
        transport: TransportChoice,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
    },

    /// Sent by the broker after a successful attach.
    Connected {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Delivery feedback from the broker.
    Ack { message: String },

    /// Delivery or validation failure reported by the broker.
    Error { message: String },
}
