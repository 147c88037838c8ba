// WebRTC transport — one peer connection + one data channel per attempt.
//
// The agent is normally the answering side: the browser peer sends an offer
// through the signaling broker, we answer, and trickle ICE runs both ways.
// Candidates are surfaced on a channel (addressed by the supervisor); a null
// candidate flips the gathering-complete event. Inbound data-channel messages
// are multiplex frames and go straight to the dispatcher's inbound queue.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{AppError, AppResult};
use crate::network::transport::ConnectionState;

/// Label for the multiplex data channel.
pub const DATA_CHANNEL_LABEL: &str = "tunnel";

/// ICE server entry (STUN or TURN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

struct Inner {
    state_tx: watch::Sender<ConnectionState>,
    gathering_tx: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    candidates: mpsc::UnboundedSender<Value>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ConnectionState>,
    gathering_rx: watch::Receiver<bool>,
}

impl WebRtcTransport {
    /// Build a fresh peer connection.
    ///
    /// `inbound` receives every binary data-channel message; `candidates`
    /// receives each local ICE candidate as its JSON payload, to be forwarded
    /// over signaling by the caller.
    pub async fn new(
        ice_servers: &[IceServer],
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        candidates: mpsc::UnboundedSender<Value>,
    ) -> AppResult<Self> {
        let servers = ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        // Loopback candidates let two co-located peers pair (single-box
        // deployments and tests); remote peers never select them.
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: servers,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Network(format!("peer connection: {e}")))?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (gathering_tx, gathering_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            state_tx,
            gathering_tx,
            inbound,
            candidates,
            channel: Mutex::new(None),
        });

        // Peer connection state drives loss detection; the data channel's
        // open event drives the connected transition.
        {
            let inner = Arc::clone(&inner);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    info!("webrtc: peer connection state: {state}");
                    match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                            inner.state_tx.send(ConnectionState::Failed).ok();
                        }
                        RTCPeerConnectionState::Closed => {
                            inner.state_tx.send(ConnectionState::Closed).ok();
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Trickle ICE: emit candidates as they are discovered; a null
        // candidate marks gathering complete.
        {
            let inner = Arc::clone(&inner);
            pc.on_ice_candidate(Box::new(move |candidate| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => {
                                let payload =
                                    serde_json::to_value(&init).unwrap_or(Value::Null);
                                inner.candidates.send(payload).ok();
                            }
                            Err(e) => warn!("webrtc: candidate to_json failed: {e}"),
                        },
                        None => {
                            info!("webrtc: ICE gathering complete");
                            inner.gathering_tx.send(true).ok();
                        }
                    }
                })
            }));
        }

        // Answering side: the peer opens the channel.
        {
            let inner = Arc::clone(&inner);
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    info!("webrtc: data channel received: {}", dc.label());
                    wire_data_channel(inner, dc).await;
                })
            }));
        }

        Ok(Self {
            pc,
            inner,
            state_rx,
            gathering_rx,
        })
    }

    /// Answer a remote offer. Returns the answer payload to send back.
    pub async fn handle_offer(&self, payload: Value) -> AppResult<Value> {
        let offer: RTCSessionDescription = serde_json::from_value(payload)
            .map_err(|e| AppError::Signaling(format!("bad offer payload: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Network(format!("set remote description: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Network(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::Network(format!("set local description: {e}")))?;

        // Trickle ICE: do not wait for gathering, candidates flow separately.
        info!("webrtc: created answer");
        serde_json::to_value(&answer)
            .map_err(|e| AppError::Serialization(format!("answer encode: {e}")))
    }

    /// Initiating side: open the data channel and produce an offer payload.
    pub async fn initiate(&self) -> AppResult<Value> {
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| AppError::Network(format!("create data channel: {e}")))?;
        wire_data_channel(Arc::clone(&self.inner), dc).await;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Network(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| AppError::Network(format!("set local description: {e}")))?;

        info!("webrtc: created offer");
        serde_json::to_value(&offer)
            .map_err(|e| AppError::Serialization(format!("offer encode: {e}")))
    }

    /// Apply a remote answer (initiating side).
    pub async fn handle_answer(&self, payload: Value) -> AppResult<()> {
        let answer: RTCSessionDescription = serde_json::from_value(payload)
            .map_err(|e| AppError::Signaling(format!("bad answer payload: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::Network(format!("set remote description: {e}")))?;
        info!("webrtc: remote answer applied");
        Ok(())
    }

    /// Apply a remote trickle candidate.
    pub async fn add_ice_candidate(&self, payload: Value) -> AppResult<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(payload)
            .map_err(|e| AppError::Signaling(format!("bad candidate payload: {e}")))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Network(format!("add candidate: {e}")))?;
        debug!("webrtc: added remote candidate");
        Ok(())
    }

    /// Send one multiplex frame over the data channel.
    pub async fn send(&self, data: Vec<u8>) -> AppResult<()> {
        let channel = self.inner.channel.lock().await.clone();
        let Some(channel) = channel else {
            return Err(AppError::Network("data channel not open".into()));
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(AppError::Network("data channel not open".into()));
        }
        channel
            .send(&Bytes::from(data))
            .await
            .map_err(|e| AppError::Network(format!("data channel send: {e}")))?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// True once the null candidate has been observed.
    pub fn gathering_complete(&self) -> bool {
        *self.gathering_rx.borrow()
    }

    pub async fn data_channel_state(&self) -> &'static str {
        match self.inner.channel.lock().await.as_ref() {
            None => "none",
            Some(dc) => match dc.ready_state() {
                RTCDataChannelState::Connecting => "connecting",
                RTCDataChannelState::Open => "open",
                RTCDataChannelState::Closing => "closing",
                RTCDataChannelState::Closed => "closed",
                _ => "unknown",
            },
        }
    }

    /// Wait until the data channel is open, a terminal state is reached, or
    /// the deadline passes.
    pub async fn wait_connected(&self, deadline: std::time::Duration) -> AppResult<()> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(deadline, async move {
            loop {
                let state = *rx.borrow();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed | ConnectionState::Closed => {
                        return Err(AppError::Network(format!(
                            "peer connection {}",
                            state.as_str()
                        )))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(AppError::Network("transport dropped".into()));
                }
            }
        })
        .await
        .map_err(|_| AppError::ConnectionTimeout)?
    }

    /// Tear the attempt down completely. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(dc) = self.inner.channel.lock().await.take() {
            dc.close().await.ok();
        }
        self.pc.close().await.ok();
        self.inner.state_tx.send(ConnectionState::Closed).ok();
    }
}

/// Attach handlers to a data channel and register it as the live channel.
async fn wire_data_channel(inner: Arc<Inner>, dc: Arc<RTCDataChannel>) {
    {
        let inner = Arc::clone(&inner);
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            info!("webrtc: data channel '{label}' open");
            inner.state_tx.send(ConnectionState::Connected).ok();
            Box::pin(async {})
        }));
    }
    {
        let inner = Arc::clone(&inner);
        dc.on_close(Box::new(move || {
            info!("webrtc: data channel closed");
            inner.state_tx.send(ConnectionState::Closed).ok();
            Box::pin(async {})
        }));
    }
    {
        let inner = Arc::clone(&inner);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                debug!("webrtc: inbound message ({} bytes)", msg.data.len());
                inner.inbound.send(msg.data.to_vec()).ok();
            })
        }));
    }

    *inner.channel.lock().await = Some(dc);
}
