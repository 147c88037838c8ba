// WebSocket signaling client for peer rendezvous.
//
// Protocol:
// 1. Connect to the broker at {signal_url}?token=...&device_id=...
// 2. Broker replies {type:"connected"} after authenticating the attach
// 3. Exchange typed control messages (offer/answer/ice-candidate/...)
//    addressed by device id; the broker stamps sender_device_id

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::protocol::signal::SignalMessage;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Client connection to the signaling broker.
pub struct SignalingClient {
    ws: WsStream,
}

impl SignalingClient {
    /// Connect and authenticate. `signal_url` is the broker's `/signal`
    /// endpoint (ws:// or wss://).
    pub async fn connect(signal_url: &str, device_id: &str, token: &str) -> AppResult<Self> {
        let base = signal_url.trim_end_matches('/');
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .append_pair("device_id", device_id)
            .finish();
        let url = format!("{base}?{query}");
        info!("signaling: connecting to {base}");

        let (ws, _response) = connect_async(&url)
            .await
            .map_err(|e| AppError::Signaling(format!("failed to connect: {e}")))?;

        info!("signaling: connected");
        Ok(Self { ws })
    }

    /// Send one signaling message.
    pub async fn send(&mut self, msg: &SignalMessage) -> AppResult<()> {
        send_on(&mut self.ws, msg).await
    }

    /// Receive the next signaling message, skipping control frames and
    /// unparseable text.
    pub async fn recv(&mut self) -> AppResult<SignalMessage> {
        loop {
            let raw = self
                .ws
                .next()
                .await
                .ok_or_else(|| AppError::Signaling("connection closed".into()))?
                .map_err(|e| AppError::Signaling(format!("recv: {e}")))?;

            if let Some(msg) = parse_incoming(raw)? {
                return Ok(msg);
            }
        }
    }

    /// Split into independently usable send and receive halves.
    pub fn split(self) -> (SignalingSink, SignalingStream) {
        let (sink, stream) = self.ws.split();
        (SignalingSink { sink }, SignalingStream { stream })
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.ok();
        info!("signaling: disconnected");
    }
}

pub struct SignalingSink {
    sink: SplitSink<WsStream, Message>,
}

impl SignalingSink {
    pub async fn send(&mut self, msg: &SignalMessage) -> AppResult<()> {
        let json = serde_json::to_string(msg)
            .map_err(|e| AppError::Serialization(format!("signal encode: {e}")))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| AppError::Signaling(format!("send: {e}")))?;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.sink.close().await.ok();
    }
}

pub struct SignalingStream {
    stream: SplitStream<WsStream>,
}

impl SignalingStream {
    pub async fn recv(&mut self) -> AppResult<SignalMessage> {
        loop {
            let raw = self
                .stream
                .next()
                .await
                .ok_or_else(|| AppError::Signaling("connection closed".into()))?
                .map_err(|e| AppError::Signaling(format!("recv: {e}")))?;

            if let Some(msg) = parse_incoming(raw)? {
                return Ok(msg);
            }
        }
    }
}

async fn send_on(ws: &mut WsStream, msg: &SignalMessage) -> AppResult<()> {
    let json = serde_json::to_string(msg)
        .map_err(|e| AppError::Serialization(format!("signal encode: {e}")))?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| AppError::Signaling(format!("send: {e}")))?;
    debug!("signaling: sent message");
    Ok(())
}

/// One step of the receive loop: `Ok(Some)` is a parsed message, `Ok(None)`
/// means skip (control frame or malformed text), `Err` means the connection
/// is gone.
fn parse_incoming(raw: Message) -> AppResult<Option<SignalMessage>> {
    match raw {
        Message::Text(text) => match serde_json::from_str::<SignalMessage>(&text) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                // A malformed message is a protocol error, not a dead link.
                warn!("signaling: ignoring unparseable message: {e}");
                Ok(None)
            }
        },
        Message::Close(_) => Err(AppError::Signaling("server closed connection".into())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(None),
        Message::Binary(_) => {
            debug!("signaling: ignoring binary message");
            Ok(None)
        }
    }
}
