// Relay broker — fallback data plane.
//
// Two authenticated binary connections pair under a shared session id. The
// first joiner parks; the second seals the session and forwarding starts:
// one pump task per direction, counting bytes, never parsing payloads.
// Termination is first-to-finish: either pump exiting closes both endpoints,
// cancels the other pump, and emits the terminal metering record.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broker::auth::TokenValidator;
use crate::broker::signal::POLICY_VIOLATION;
use crate::error::{AppError, AppResult};

/// Terminal per-session accounting, emitted exactly once.
#[derive(Debug, Clone)]
pub struct MeterRecord {
    pub session_id: String,
    pub duration: Duration,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub total: u64,
}

struct RelaySession {
    id: String,
    created_at: Instant,
    bytes_a_to_b: AtomicU64,
    bytes_b_to_a: AtomicU64,
    slot: Mutex<SessionSlot>,
}

enum SessionSlot {
    /// One endpoint attached, parked until its peer arrives.
    Waiting(Option<WebSocket>),
    /// Both endpoints attached, pumps running.
    Forwarding,
}

impl RelaySession {
    fn new(id: String, first: WebSocket) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            bytes_a_to_b: AtomicU64::new(0),
            bytes_b_to_a: AtomicU64::new(0),
            slot: Mutex::new(SessionSlot::Waiting(Some(first))),
        }
    }
}

pub struct RelayBroker {
    registry: Mutex<HashMap<String, Arc<RelaySession>>>,
    validator: Arc<dyn TokenValidator>,
    meter: Option<mpsc::UnboundedSender<MeterRecord>>,
}

impl RelayBroker {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            validator,
            meter: None,
        }
    }

    /// Mirror terminal metering records onto a channel (tests, billing hooks).
    pub fn with_meter(mut self, meter: mpsc::UnboundedSender<MeterRecord>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[derive(Deserialize)]
struct RelayQuery {
    token: String,
}

pub fn router(broker: Arc<RelayBroker>) -> axum::Router {
    axum::Router::new()
        .route("/relay/{session_id}", axum::routing::get(ws_handler))
        .with_state(broker)
}

/// Bind and serve; returns the bound address and the server task.
pub async fn serve(
    broker: Arc<RelayBroker>,
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
            tracing::error!(error = %e, "relay broker server error");
        }
    });
    Ok((bound, handle))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<RelayQuery>,
    State(broker): State<Arc<RelayBroker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, query, broker))
}

enum Attach {
    /// First endpoint: the socket is parked inside the session.
    Parked,
    /// Second endpoint: seal and forward both parked and fresh sockets.
    Sealed(WebSocket, WebSocket, Arc<RelaySession>),
    /// Session already has two endpoints.
    Refused(WebSocket),
}

async fn handle_socket(
    mut socket: WebSocket,
    session_id: String,
    query: RelayQuery,
    broker: Arc<RelayBroker>,
) {
    if broker.validator.validate(&query.token).is_none() {
        tracing::warn!(session_id = %session_id, "relay attach rejected: invalid token");
        socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "invalid token".into(),
            })))
            .await
            .ok();
        return;
    }

    let attach = {
        let mut registry = broker.registry.lock().await;
        match registry.get(&session_id) {
            None => {
                let session = Arc::new(RelaySession::new(session_id.clone(), socket));
                registry.insert(session_id.clone(), session);
                tracing::info!(session_id = %session_id, "relay session created, waiting for peer");
                Attach::Parked
            }
            Some(session) => {
                let mut slot = session.slot.lock().await;
                match &mut *slot {
                    SessionSlot::Waiting(first) => {
                        let first = first.take().expect("waiting slot always holds a socket");
                        *slot = SessionSlot::Forwarding;
                        Attach::Sealed(first, socket, Arc::clone(session))
                    }
                    SessionSlot::Forwarding => Attach::Refused(socket),
                }
            }
        }
    };

    match attach {
        // The parked socket lives in the registry; this handler is done.
        Attach::Parked => {}
        Attach::Refused(mut socket) => {
            tracing::warn!(session_id = %session_id, "third attach refused");
            socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "session already paired".into(),
                })))
                .await
                .ok();
        }
        Attach::Sealed(first, second, session) => {
            tracing::info!(session_id = %session_id, "relay session sealed, forwarding");
            run_forwarding(first, second, session, &broker).await;
        }
    }
}

/// Pump frames both ways until either side finishes, then close everything,
/// emit the metering record, and drop the session from the registry.
async fn run_forwarding(
    endpoint_a: WebSocket,
    endpoint_b: WebSocket,
    session: Arc<RelaySession>,
    broker: &RelayBroker,
) {
    let (a_sink, a_stream) = endpoint_a.split();
    let (b_sink, b_stream) = endpoint_b.split();

    let mut a_to_b = tokio::spawn(pump(
        a_stream,
        b_sink,
        Arc::clone(&session),
        Direction::AToB,
    ));
    let mut b_to_a = tokio::spawn(pump(
        b_stream,
        a_sink,
        Arc::clone(&session),
        Direction::BToA,
    ));

    tokio::select! {
        _ = &mut a_to_b => b_to_a.abort(),
        _ = &mut b_to_a => a_to_b.abort(),
    }

    broker.registry.lock().await.remove(&session.id);

    let bytes_a_to_b = session.bytes_a_to_b.load(Ordering::Relaxed);
    let bytes_b_to_a = session.bytes_b_to_a.load(Ordering::Relaxed);
    let record = MeterRecord {
        session_id: session.id.clone(),
        duration: session.created_at.elapsed(),
        bytes_a_to_b,
        bytes_b_to_a,
        total: bytes_a_to_b + bytes_b_to_a,
    };
    tracing::info!(
        session_id = %record.session_id,
        duration_ms = record.duration.as_millis() as u64,
        bytes_a_to_b = record.bytes_a_to_b,
        bytes_b_to_a = record.bytes_b_to_a,
        total = record.total,
        "relay session closed"
    );
    if let Some(meter) = &broker.meter {
        meter.send(record).ok();
    }
}

#[derive(Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::AToB => "a->b",
            Direction::BToA => "b->a",
        }
    }
}

async fn pump(
    mut source: SplitStream<WebSocket>,
    mut dest: SplitSink<WebSocket, Message>,
    session: Arc<RelaySession>,
    direction: Direction,
) {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => {
                let counter = match direction {
                    Direction::AToB => &session.bytes_a_to_b,
                    Direction::BToA => &session.bytes_b_to_a,
                };
                counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                if dest.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(_))) => {
                tracing::debug!(
                    session_id = %session.id,
                    direction = direction.label(),
                    "ignoring text message on relay session"
                );
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by the server machinery.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(
                    session_id = %session.id,
                    direction = direction.label(),
                    error = %e,
                    "relay pump error"
                );
                break;
            }
        }
    }

    tracing::info!(
        session_id = %session.id,
        direction = direction.label(),
        "relay direction finished"
    );
    // Give the surviving endpoint a clean close before everything drops.
    dest.send(Message::Close(None)).await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::auth::StaticTokenValidator;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start_test_relay() -> (
        SocketAddr,
        Arc<RelayBroker>,
        mpsc::UnboundedReceiver<MeterRecord>,
    ) {
        let validator = Arc::new(StaticTokenValidator::new([(
            "tok".to_string(),
            "alice".to_string(),
        )]));
        let (meter_tx, meter_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(RelayBroker::new(validator).with_meter(meter_tx));
        let (addr, _handle) = serve(Arc::clone(&broker), "127.0.0.1:0").await.unwrap();
        (addr, broker, meter_rx)
    }

    async fn join(addr: SocketAddr, session_id: &str) -> ClientWs {
        let url = format!("ws://{addr}/relay/{session_id}?token=tok");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws
    }

    async fn send_bytes(ws: &mut ClientWs, data: Vec<u8>) {
        use futures_util::SinkExt;
        ws.send(tungstenite::Message::Binary(data.into()))
            .await
            .unwrap();
    }

    async fn recv_bytes(ws: &mut ClientWs) -> Vec<u8> {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("recv error");
            match msg {
                tungstenite::Message::Binary(data) => return data.to_vec(),
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {}
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn pair_and_forward_both_directions() {
        let (addr, _broker, _meter) = start_test_relay().await;
        let mut a = join(addr, "sess-1").await;
        let mut b = join(addr, "sess-1").await;

        send_bytes(&mut a, vec![1, 2, 3]).await;
        assert_eq!(recv_bytes(&mut b).await, vec![1, 2, 3]);

        send_bytes(&mut b, vec![9, 8]).await;
        assert_eq!(recv_bytes(&mut a).await, vec![9, 8]);
    }

    #[tokio::test]
    async fn per_direction_order_is_preserved() {
        let (addr, _broker, _meter) = start_test_relay().await;
        let mut a = join(addr, "sess-ord").await;
        let mut b = join(addr, "sess-ord").await;

        for i in 0..20u8 {
            send_bytes(&mut a, vec![i]).await;
        }
        for i in 0..20u8 {
            assert_eq!(recv_bytes(&mut b).await, vec![i]);
        }
    }

    #[tokio::test]
    async fn third_attach_is_refused() {
        let (addr, _broker, _meter) = start_test_relay().await;
        let _a = join(addr, "sess-2").await;
        let _b = join(addr, "sess-2").await;

        let mut c = join(addr, "sess-2").await;
        match timeout(Duration::from_secs(5), c.next()).await.unwrap() {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), POLICY_VIOLATION);
            }
            other => panic!("expected refusal close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_token_is_closed() {
        let (addr, broker, _meter) = start_test_relay().await;
        let url = format!("ws://{addr}/relay/sess-x?token=bogus");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), POLICY_VIOLATION);
            }
            other => panic!("expected policy-violation close, got {other:?}"),
        }
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_emits_metering_record_and_removes_session() {
        let (addr, broker, mut meter) = start_test_relay().await;
        let mut a = join(addr, "sess-meter").await;
        let mut b = join(addr, "sess-meter").await;

        send_bytes(&mut a, vec![0xAA; 10_000]).await;
        assert_eq!(recv_bytes(&mut b).await.len(), 10_000);

        send_bytes(&mut b, vec![0xBB; 4_000]).await;
        assert_eq!(recv_bytes(&mut a).await.len(), 4_000);

        drop(a);

        let record = timeout(Duration::from_secs(5), meter.recv())
            .await
            .expect("timed out waiting for meter record")
            .expect("meter channel closed");
        assert_eq!(record.session_id, "sess-meter");
        assert_eq!(record.bytes_a_to_b, 10_000);
        assert_eq!(record.bytes_b_to_a, 4_000);
        assert_eq!(record.total, 14_000);

        // Session is gone; the id is reusable.
        let mut tries = 0;
        while broker.session_count().await != 0 && tries < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tries += 1;
        }
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn peer_sees_close_when_other_side_disconnects() {
        let (addr, _broker, _meter) = start_test_relay().await;
        let a = join(addr, "sess-close").await;
        let mut b = join(addr, "sess-close").await;

        drop(a);

        // b's connection terminates (close frame or stream end).
        match timeout(Duration::from_secs(5), b.next()).await.unwrap() {
            Some(Ok(tungstenite::Message::Close(_))) | None => {}
            Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }
}
