// Signaling broker — rendezvous for peers, addressed by device id.
//
// Each attached connection is authenticated (bearer token + device ownership)
// and registered under its device id; at most one live session per device, a
// newer attach evicts the older with a policy-violation close. Control
// messages are routed by `target_device_id` with a `sender_device_id` stamp;
// the payloads stay opaque. All state is in-memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broker::auth::{DeviceDirectory, TokenValidator};
use crate::error::{AppError, AppResult};
use crate::protocol::signal::{SignalMessage, MAX_SIGNAL_MESSAGE_BYTES};

/// Close code for authentication failures and superseded sessions.
pub const POLICY_VIOLATION: u16 = 1008;

struct PeerHandle {
    sender: mpsc::UnboundedSender<Message>,
    #[allow(dead_code)]
    user_id: String,
}

pub struct SignalBroker {
    registry: Mutex<HashMap<String, PeerHandle>>,
    validator: Arc<dyn TokenValidator>,
    directory: Arc<dyn DeviceDirectory>,
    /// Relay broker URL advertised in connect-request-received messages.
    relay_url: Option<String>,
}

impl SignalBroker {
    pub fn new(validator: Arc<dyn TokenValidator>, directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            validator,
            directory,
            relay_url: None,
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    pub async fn connected_devices(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[derive(Deserialize)]
struct AttachQuery {
    token: String,
    device_id: String,
}

pub fn router(broker: Arc<SignalBroker>) -> axum::Router {
    axum::Router::new()
        .route("/signal", axum::routing::get(ws_handler))
        .with_state(broker)
}

/// Bind and serve; returns the bound address and the server task.
pub async fn serve(
    broker: Arc<SignalBroker>,
    addr: &str,
) -> AppResult<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Network(format!("bind {addr}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| AppError::Network(e.to_string()))?;
    let app = router(broker);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "signal broker server error");
        }
    });
    Ok((bound, handle))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AttachQuery>,
    State(broker): State<Arc<SignalBroker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, broker))
}

async fn handle_socket(mut socket: WebSocket, query: AttachQuery, broker: Arc<SignalBroker>) {
    // Authenticate: token validity, then device ownership.
    let Some(user_id) = broker.validator.validate(&query.token) else {
        tracing::warn!(device_id = %query.device_id, "attach rejected: invalid token");
        close_policy_violation(&mut socket, "invalid token").await;
        return;
    };
    let device_id = query.device_id;
    match broker.directory.owner_of(&device_id) {
        Some(owner) if owner == user_id => {}
        _ => {
            tracing::warn!(device_id = %device_id, user_id = %user_id, "attach rejected: device not owned by user");
            close_policy_violation(&mut socket, "device not owned").await;
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let registered = tx.clone();

    // Register, evicting any prior session for this device id.
    {
        let mut registry = broker.registry.lock().await;
        let handle = PeerHandle {
            sender: tx.clone(),
            user_id,
        };
        if let Some(old) = registry.insert(device_id.clone(), handle) {
            tracing::info!(device_id = %device_id, "superseding existing signaling session");
            old.sender
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "session superseded".into(),
                })))
                .ok();
        }
    }
    tracing::info!(device_id = %device_id, "device attached to signaling broker");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Post-attach confirmation.
    let connected = SignalMessage::Connected {
        device_id: device_id.clone(),
        message: Some("Connected to signaling broker".to_string()),
    };
    if send_json(&mut ws_sender, &connected).await.is_err() {
        tracing::warn!(device_id = %device_id, "failed to send connected confirmation");
        unregister_if_current(&broker, &device_id, &registered).await;
        return;
    }

    // Writer: drains the registry channel onto the socket.
    let writer_device = device_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::debug!(device_id = %writer_device, "signaling write failed");
                break;
            }
            if is_close {
                break;
            }
        }
    });

    // Reader: validates, stamps, and routes every text frame.
    let reader_broker = Arc::clone(&broker);
    let reader_device = device_id.clone();
    let reader_tx = tx.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_message(&reader_broker, &reader_device, &reader_tx, text.as_str())
                        .await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    unregister_if_current(&broker, &device_id, &registered).await;
    tracing::info!(device_id = %device_id, "device detached from signaling broker");
}

/// Remove the registration unless a newer session has already replaced it.
async fn unregister_if_current(
    broker: &SignalBroker,
    device_id: &str,
    sender: &mpsc::UnboundedSender<Message>,
) {
    let mut registry = broker.registry.lock().await;
    if registry
        .get(device_id)
        .is_some_and(|h| h.sender.same_channel(sender))
    {
        registry.remove(device_id);
    }
}

async fn handle_message(
    broker: &SignalBroker,
    sender_device: &str,
    reply: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    if text.len() > MAX_SIGNAL_MESSAGE_BYTES {
        reply_error(reply, "Message exceeds 64 KiB limit");
        return;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            reply_error(reply, "Invalid JSON format");
            return;
        }
    };

    let msg_type = value.get("type").and_then(Value::as_str);
    let target = value.get("target_device_id").and_then(Value::as_str);
    let (Some(msg_type), Some(target)) = (msg_type, target) else {
        reply_error(reply, "Invalid message format: missing type or target_device_id");
        return;
    };
    let msg_type = msg_type.to_string();
    let target = target.to_string();

    let outgoing = rewrite_for_target(broker, sender_device, &msg_type, &value);

    let delivered = {
        let registry = broker.registry.lock().await;
        match registry.get(&target) {
            Some(handle) => handle
                .sender
                .send(Message::Text(outgoing.to_string().into()))
                .is_ok(),
            None => false,
        }
    };

    if delivered {
        tracing::info!(
            from = %sender_device,
            to = %target,
            msg_type = %msg_type,
            "routed signaling message"
        );
        reply_msg(
            reply,
            &SignalMessage::Ack {
                message: format!("Message delivered to {target}"),
            },
        );
    } else {
        tracing::warn!(to = %target, "target device not connected");
        reply_error(reply, &format!("Target device {target} not connected"));
    }
}

/// Stamp the sender and, for the connect coordination types, rewrite into the
/// `-received` form the target expects. Sender-supplied fields are preserved.
fn rewrite_for_target(
    broker: &SignalBroker,
    sender_device: &str,
    msg_type: &str,
    value: &Value,
) -> Value {
    match msg_type {
        "connect-request" => {
            let mut out = json!({
                "type": "connect-request-received",
                "from_device_id": sender_device,
                "preferred_transport": value
                    .get("preferred_transport")
                    .cloned()
                    .unwrap_or_else(|| json!("auto")),
                "relay_session_id": value
                    .get("relay_session_id")
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| json!(sender_device)),
            });
            if let Some(relay_url) = &broker.relay_url {
                out["relay_url"] = json!(relay_url);
            }
            out
        }
        "connect-ack" => {
            let mut out = json!({
                "type": "connect-ack-received",
                "from_device_id": sender_device,
            });
            for field in ["transport", "status", "relay_session_id"] {
                if let Some(v) = value.get(field).filter(|v| !v.is_null()) {
                    out[field] = v.clone();
                }
            }
            out
        }
        _ => {
            let mut out = value.clone();
            out["sender_device_id"] = json!(sender_device);
            out
        }
    }
}

fn reply_error(reply: &mpsc::UnboundedSender<Message>, message: &str) {
    reply_msg(
        reply,
        &SignalMessage::Error {
            message: message.to_string(),
        },
    );
}

fn reply_msg(reply: &mpsc::UnboundedSender<Message>, msg: &SignalMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        reply.send(Message::Text(json.into())).ok();
    }
}

async fn send_json(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &SignalMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    ws_sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

async fn close_policy_violation(socket: &mut WebSocket, reason: &str) {
    socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::auth::{StaticDeviceDirectory, StaticTokenValidator};
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start_test_broker() -> (SocketAddr, Arc<SignalBroker>) {
        let validator = Arc::new(StaticTokenValidator::new([
            ("tok-a".to_string(), "alice".to_string()),
            ("tok-b".to_string(), "alice".to_string()),
        ]));
        let directory = Arc::new(StaticDeviceDirectory::new([
            ("dev-a".to_string(), "alice".to_string()),
            ("dev-b".to_string(), "alice".to_string()),
        ]));
        let broker = Arc::new(
            SignalBroker::new(validator, directory).with_relay_url("ws://relay.test:8001"),
        );
        let (addr, _handle) = serve(Arc::clone(&broker), "127.0.0.1:0").await.unwrap();
        (addr, broker)
    }

    async fn attach(addr: SocketAddr, device_id: &str, token: &str) -> ClientWs {
        let url = format!("ws://{addr}/signal?token={token}&device_id={device_id}");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let confirm = recv_json(&mut ws).await;
        assert_eq!(confirm["type"], "connected");
        assert_eq!(confirm["device_id"], device_id);
        ws
    }

    async fn recv_json(ws: &mut ClientWs) -> Value {
        loop {
            let msg = ws.next().await.expect("stream ended").expect("recv error");
            match msg {
                tungstenite::Message::Text(text) => {
                    return serde_json::from_str(&text).unwrap();
                }
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {}
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    async fn send_text(ws: &mut ClientWs, text: String) {
        use futures_util::SinkExt;
        ws.send(tungstenite::Message::Text(text.into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn offer_routed_with_sender_stamp_and_ack() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;
        let mut ws_b = attach(addr, "dev-b", "tok-b").await;

        send_text(
            &mut ws_a,
            json!({
                "type": "offer",
                "target_device_id": "dev-b",
                "payload": {"sdp": "v=0", "type": "offer"}
            })
            .to_string(),
        )
        .await;

        let delivered = recv_json(&mut ws_b).await;
        assert_eq!(delivered["type"], "offer");
        assert_eq!(delivered["sender_device_id"], "dev-a");
        assert_eq!(delivered["payload"]["sdp"], "v=0");

        let ack = recv_json(&mut ws_a).await;
        assert_eq!(ack["type"], "ack");
    }

    #[tokio::test]
    async fn absent_target_yields_error_and_connection_survives() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;

        send_text(
            &mut ws_a,
            json!({"type": "offer", "target_device_id": "dev-b", "payload": {}}).to_string(),
        )
        .await;
        let err = recv_json(&mut ws_a).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("not connected"));

        // Still attached and usable.
        send_text(&mut ws_a, "not json at all".to_string()).await;
        let err = recv_json(&mut ws_a).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("Invalid JSON"));
    }

    #[tokio::test]
    async fn missing_fields_rejected() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;

        send_text(&mut ws_a, json!({"payload": {}}).to_string()).await;
        let err = recv_json(&mut ws_a).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"]
            .as_str()
            .unwrap()
            .contains("missing type or target_device_id"));
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;

        let msg = json!({
            "type": "offer",
            "target_device_id": "dev-b",
            "payload": {"sdp": "x".repeat(65 * 1024)}
        });
        send_text(&mut ws_a, msg.to_string()).await;

        let err = recv_json(&mut ws_a).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("64 KiB"));
    }

    #[tokio::test]
    async fn invalid_token_is_closed_with_policy_violation() {
        let (addr, _broker) = start_test_broker().await;
        let url = format!("ws://{addr}/signal?token=bogus&device_id=dev-a");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        match ws.next().await {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), POLICY_VIOLATION);
            }
            other => panic!("expected policy-violation close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_not_owned_is_closed_with_policy_violation() {
        let (addr, _broker) = start_test_broker().await;
        // Valid token, unknown device.
        let url = format!("ws://{addr}/signal?token=tok-a&device_id=dev-zz");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        match ws.next().await {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), POLICY_VIOLATION);
            }
            other => panic!("expected policy-violation close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_attach_supersedes_first() {
        let (addr, broker) = start_test_broker().await;
        let mut first = attach(addr, "dev-a", "tok-a").await;
        let mut second = attach(addr, "dev-a", "tok-b").await;

        // First connection is closed with a policy-violation code.
        match first.next().await {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), POLICY_VIOLATION);
            }
            other => panic!("expected close on superseded session, got {other:?}"),
        }

        // At most one live session per device id.
        assert_eq!(broker.connected_devices().await, 1);

        // Traffic reaches the second session.
        let mut ws_b = attach(addr, "dev-b", "tok-b").await;
        send_text(
            &mut ws_b,
            json!({"type": "offer", "target_device_id": "dev-a", "payload": {}}).to_string(),
        )
        .await;
        let delivered = recv_json(&mut second).await;
        assert_eq!(delivered["type"], "offer");
        assert_eq!(delivered["sender_device_id"], "dev-b");
    }

    #[tokio::test]
    async fn connect_request_rewritten_for_target() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;
        let mut ws_b = attach(addr, "dev-b", "tok-b").await;

        send_text(
            &mut ws_a,
            json!({
                "type": "connect-request",
                "target_device_id": "dev-b",
                "preferred_transport": "webrtc"
            })
            .to_string(),
        )
        .await;

        let received = recv_json(&mut ws_b).await;
        assert_eq!(received["type"], "connect-request-received");
        assert_eq!(received["from_device_id"], "dev-a");
        assert_eq!(received["preferred_transport"], "webrtc");
        // Relay session defaults to the sender's device id.
        assert_eq!(received["relay_session_id"], "dev-a");
        assert_eq!(received["relay_url"], "ws://relay.test:8001");

        let ack = recv_json(&mut ws_a).await;
        assert_eq!(ack["type"], "ack");
    }

    #[tokio::test]
    async fn connect_ack_rewritten_for_requester() {
        let (addr, _broker) = start_test_broker().await;
        let mut ws_a = attach(addr, "dev-a", "tok-a").await;
        let mut ws_b = attach(addr, "dev-b", "tok-b").await;

        send_text(
            &mut ws_b,
            json!({
                "type": "connect-ack",
                "target_device_id": "dev-a",
                "transport": "relay",
                "status": "connecting",
                "relay_session_id": "dev-b"
            })
            .to_string(),
        )
        .await;

        let received = recv_json(&mut ws_a).await;
        assert_eq!(received["type"], "connect-ack-received");
        assert_eq!(received["from_device_id"], "dev-b");
        assert_eq!(received["transport"], "relay");
        assert_eq!(received["status"], "connecting");
        assert_eq!(received["relay_session_id"], "dev-b");
    }

    #[tokio::test]
    async fn detach_removes_registration_allowing_reattach() {
        let (addr, broker) = start_test_broker().await;
        let ws_a = attach(addr, "dev-a", "tok-a").await;
        drop(ws_a);

        // Wait for the broker to notice the detach.
        let mut tries = 0;
        while broker.connected_devices().await != 0 && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tries += 1;
        }
        assert_eq!(broker.connected_devices().await, 0);

        let _ws_a = attach(addr, "dev-a", "tok-a").await;
        assert_eq!(broker.connected_devices().await, 1);
    }
}
