// WebSocket proxy engine — terminates WS_CONNECT / WS_DATA / WS_CLOSE frames
// against upstream sockets and relays upstream traffic back as frames.
//
// The per-connection registry is owned by this proxy alone. Each upstream has
// an up-relay task reading server messages; the task removes its own
// registration on exit, so a vanished upstream cannot leak an entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::protocol::frame::{opcode, WsCloseFrame, WsConnectFrame, WsDataFrame};
use crate::proxy::router::Router;

/// Deadline for the upstream WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake-managed headers that must not be copied from the peer.
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

type UpstreamWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Upstream {
    sink: SplitSink<UpstreamWs, Message>,
    relay: JoinHandle<()>,
    epoch: u64,
}

pub struct WsProxy {
    router: Arc<Router>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    connections: Arc<Mutex<HashMap<u32, Upstream>>>,
    next_epoch: AtomicU64,
}

impl WsProxy {
    pub fn new(router: Arc<Router>, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            router,
            outbound,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// WS_CONNECT: open the upstream socket and start relaying.
    pub async fn handle_connect(&self, data: &[u8]) {
        let frame = match WsConnectFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ws proxy: undecodable WS_CONNECT frame: {e}");
                return;
            }
        };
        let conn_id = frame.connection_id;
        info!("ws proxy: connect {conn_id}: {}", frame.url);

        match self.open_upstream(&frame).await {
            Ok(ws) => {
                let (sink, stream) = ws.split();
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let relay = tokio::spawn(relay_upstream(
                    stream,
                    conn_id,
                    epoch,
                    self.outbound.clone(),
                    Arc::clone(&self.connections),
                ));

                let mut conns = self.connections.lock().await;
                if let Some(old) = conns.insert(conn_id, Upstream { sink, relay, epoch }) {
                    warn!("ws proxy: superseding existing connection {conn_id}");
                    old.relay.abort();
                    let mut old_sink = old.sink;
                    tokio::spawn(async move {
                        old_sink.close().await.ok();
                    });
                }
                info!("ws proxy: {conn_id} connected");
            }
            Err(e) => {
                warn!("ws proxy: connect {conn_id} failed: {e}");
                let close = WsCloseFrame {
                    connection_id: conn_id,
                    close_code: 1006,
                    reason: format!("Connection failed: {e}"),
                };
                self.outbound.send(close.encode()).ok();
            }
        }
    }

    /// WS_DATA: forward a peer message to the upstream, respecting the opcode.
    pub async fn handle_data(&self, data: &[u8]) {
        let frame = match WsDataFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ws proxy: undecodable WS_DATA frame: {e}");
                return;
            }
        };
        let conn_id = frame.connection_id;

        let message = match frame.opcode {
            opcode::TEXT => match String::from_utf8(frame.payload) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => {
                    warn!("ws proxy: {conn_id}: text frame is not valid UTF-8, dropping");
                    return;
                }
            },
            opcode::BINARY => Message::Binary(frame.payload.into()),
            opcode::PING => Message::Ping(frame.payload.into()),
            opcode::PONG => Message::Pong(frame.payload.into()),
            other => {
                debug!("ws proxy: {conn_id}: ignoring opcode 0x{other:02x}");
                return;
            }
        };

        let mut conns = self.connections.lock().await;
        let Some(upstream) = conns.get_mut(&conn_id) else {
            warn!("ws proxy: data for unknown connection {conn_id}, dropping");
            return;
        };
        if let Err(e) = upstream.sink.send(message).await {
            warn!("ws proxy: forward to upstream {conn_id} failed: {e}");
        }
    }

    /// WS_CLOSE: close the upstream with the peer's code/reason and unregister.
    pub async fn handle_close(&self, data: &[u8]) {
        let frame = match WsCloseFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ws proxy: undecodable WS_CLOSE frame: {e}");
                return;
            }
        };
        let conn_id = frame.connection_id;
        info!(
            "ws proxy: close {conn_id}: code={} reason='{}'",
            frame.close_code, frame.reason
        );

        let removed = self.connections.lock().await.remove(&conn_id);
        match removed {
            Some(mut upstream) => {
                upstream.relay.abort();
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::from(frame.close_code),
                    reason: frame.reason.into(),
                }));
                upstream.sink.send(close).await.ok();
            }
            None => warn!("ws proxy: close for unknown connection {conn_id}"),
        }
    }

    /// Close every live upstream and cancel every relay task.
    pub async fn close_all(&self) {
        let mut conns = self.connections.lock().await;
        for (conn_id, upstream) in conns.drain() {
            debug!("ws proxy: closing connection {conn_id}");
            upstream.relay.abort();
            let mut sink = upstream.sink;
            tokio::spawn(async move {
                sink.close().await.ok();
            });
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    async fn open_upstream(&self, frame: &WsConnectFrame) -> AppResult<UpstreamWs> {
        let path = path_and_query(&frame.url);
        let target = self.router.route(&path);
        let ws_url = format!("{}{path}", ws_base(&target));
        debug!("ws proxy: upstream url {ws_url}");

        let mut request = ws_url
            .into_client_request()
            .map_err(|e| AppError::WebSocket(format!("bad upstream url: {e}")))?;
        for (name, value) in &frame.headers {
            if HANDSHAKE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!("ws proxy: dropping unrepresentable header '{name}'"),
            }
        }

        let (ws, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| AppError::ConnectionTimeout)?
            .map_err(|e| AppError::WebSocket(format!("handshake: {e}")))?;
        Ok(ws)
    }
}

/// Reduce a connect URL (absolute or path-only) to its path + query.
fn path_and_query(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        let mut out = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            out.push('?');
            out.push_str(query);
        }
        out
    } else {
        raw.to_string()
    }
}

/// Rewrite an http(s) base URL to its ws(s) equivalent, keeping the host.
fn ws_base(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target.to_string()
    }
}

/// Read upstream messages until the socket terminates, emitting WS_DATA and
/// finally one WS_CLOSE. Removes the registration on exit; a cancelled task
/// exits silently (the canceller already owns cleanup).
async fn relay_upstream(
    mut stream: SplitStream<UpstreamWs>,
    conn_id: u32,
    epoch: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    connections: Arc<Mutex<HashMap<u32, Upstream>>>,
) {
    let close = loop {
        let data_frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => WsDataFrame {
                connection_id: conn_id,
                opcode: opcode::TEXT,
                payload: text.as_bytes().to_vec(),
            },
            Some(Ok(Message::Binary(payload))) => WsDataFrame {
                connection_id: conn_id,
                opcode: opcode::BINARY,
                payload: payload.to_vec(),
            },
            Some(Ok(Message::Ping(payload))) => WsDataFrame {
                connection_id: conn_id,
                opcode: opcode::PING,
                payload: payload.to_vec(),
            },
            Some(Ok(Message::Pong(payload))) => WsDataFrame {
                connection_id: conn_id,
                opcode: opcode::PONG,
                payload: payload.to_vec(),
            },
            Some(Ok(Message::Close(close_frame))) => {
                break match close_frame {
                    Some(cf) => WsCloseFrame {
                        connection_id: conn_id,
                        close_code: u16::from(cf.code),
                        reason: cf.reason.to_string(),
                    },
                    None => WsCloseFrame {
                        connection_id: conn_id,
                        close_code: 1000,
                        reason: "Server closed connection".into(),
                    },
                };
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => {
                break WsCloseFrame {
                    connection_id: conn_id,
                    close_code: 1006,
                    reason: format!("Relay error: {e}"),
                };
            }
            None => {
                break WsCloseFrame {
                    connection_id: conn_id,
                    close_code: 1000,
                    reason: "Server closed connection".into(),
                };
            }
        };

        if outbound.send(data_frame.encode()).is_err() {
            // Agent side is gone; nothing left to relay to.
            break WsCloseFrame {
                connection_id: conn_id,
                close_code: 1001,
                reason: "Tunnel shutting down".into(),
            };
        }
    };

    info!(
        "ws proxy: {conn_id}: upstream ended (code={}), unregistering",
        close.close_code
    );
    outbound.send(close.encode()).ok();

    let mut conns = connections.lock().await;
    if conns.get(&conn_id).map(|u| u.epoch) == Some(epoch) {
        conns.remove(&conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Frame, HeaderMap};
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::net::SocketAddr;
    use tokio::time::timeout;

    async fn echo_socket(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                AxMessage::Text(t) => AxMessage::Text(t),
                AxMessage::Binary(b) => AxMessage::Binary(b),
                AxMessage::Close(_) => break,
                _ => continue,
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    }

    async fn hangup_socket(mut socket: WebSocket) {
        // Greet, then close from the server side.
        socket.send(AxMessage::Text("bye".into())).await.ok();
        socket.close().await.ok();
    }

    async fn spawn_ws_upstream() -> SocketAddr {
        let app = axum::Router::new()
            .route(
                "/echo",
                get(|ws: WebSocketUpgrade| async move {
                    ws.on_upgrade(echo_socket).into_response()
                }),
            )
            .route(
                "/hangup",
                get(|ws: WebSocketUpgrade| async move {
                    ws.on_upgrade(hangup_socket).into_response()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn proxy_for(addr: SocketAddr) -> (WsProxy, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = WsProxy::new(Arc::new(Router::new(format!("http://{addr}"))), tx);
        (proxy, rx)
    }

    fn connect_frame(conn_id: u32, url: &str) -> Vec<u8> {
        WsConnectFrame {
            connection_id: conn_id,
            url: url.into(),
            headers: HeaderMap::new(),
        }
        .encode()
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Frame {
        let raw = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed");
        Frame::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn echo_roundtrip_then_close() {
        let addr = spawn_ws_upstream().await;
        let (proxy, mut rx) = proxy_for(addr);

        proxy.handle_connect(&connect_frame(1, "/echo")).await;
        assert_eq!(proxy.connection_count().await, 1);

        let data = WsDataFrame {
            connection_id: 1,
            opcode: opcode::TEXT,
            payload: b"hi".to_vec(),
        };
        proxy.handle_data(&data.encode()).await;

        match next_frame(&mut rx).await {
            Frame::WsData(f) => {
                assert_eq!(f.connection_id, 1);
                assert_eq!(f.opcode, opcode::TEXT);
                assert_eq!(f.payload, b"hi");
            }
            other => panic!("expected WS_DATA, got {other:?}"),
        }

        let close = WsCloseFrame {
            connection_id: 1,
            close_code: 1000,
            reason: String::new(),
        };
        proxy.handle_close(&close.encode()).await;
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn binary_payload_is_relayed_with_opcode() {
        let addr = spawn_ws_upstream().await;
        let (proxy, mut rx) = proxy_for(addr);

        proxy.handle_connect(&connect_frame(2, "/echo")).await;
        let payload = vec![0u8, 1, 2, 255];
        proxy
            .handle_data(
                &WsDataFrame {
                    connection_id: 2,
                    opcode: opcode::BINARY,
                    payload: payload.clone(),
                }
                .encode(),
            )
            .await;

        match next_frame(&mut rx).await {
            Frame::WsData(f) => {
                assert_eq!(f.opcode, opcode::BINARY);
                assert_eq!(f.payload, payload);
            }
            other => panic!("expected WS_DATA, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_connect_emits_1006_close() {
        // Nothing listening here.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proxy = WsProxy::new(Arc::new(Router::new("http://127.0.0.1:9")), tx);

        proxy.handle_connect(&connect_frame(7, "/echo")).await;

        match next_frame(&mut rx).await {
            Frame::WsClose(f) => {
                assert_eq!(f.connection_id, 7);
                assert_eq!(f.close_code, 1006);
                assert!(f.reason.contains("Connection failed"), "got: {}", f.reason);
            }
            other => panic!("expected WS_CLOSE, got {other:?}"),
        }
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn data_for_unknown_connection_is_dropped() {
        let addr = spawn_ws_upstream().await;
        let (proxy, mut rx) = proxy_for(addr);

        proxy
            .handle_data(
                &WsDataFrame {
                    connection_id: 99,
                    opcode: opcode::TEXT,
                    payload: b"nobody home".to_vec(),
                }
                .encode(),
            )
            .await;

        // Nothing should come back.
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "unexpected frame emitted"
        );
    }

    #[tokio::test]
    async fn upstream_hangup_emits_close_and_unregisters() {
        let addr = spawn_ws_upstream().await;
        let (proxy, mut rx) = proxy_for(addr);

        proxy.handle_connect(&connect_frame(3, "/hangup")).await;

        match next_frame(&mut rx).await {
            Frame::WsData(f) => assert_eq!(f.payload, b"bye"),
            other => panic!("expected WS_DATA, got {other:?}"),
        }
        match next_frame(&mut rx).await {
            Frame::WsClose(f) => assert_eq!(f.connection_id, 3),
            other => panic!("expected WS_CLOSE, got {other:?}"),
        }

        // The relay task's exit path removes the registration.
        let mut tries = 0;
        while proxy.connection_count().await != 0 && tries < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tries += 1;
        }
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_connect_supersedes() {
        let addr = spawn_ws_upstream().await;
        let (proxy, _rx) = proxy_for(addr);

        proxy.handle_connect(&connect_frame(5, "/echo")).await;
        proxy.handle_connect(&connect_frame(5, "/echo")).await;
        assert_eq!(proxy.connection_count().await, 1);
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let addr = spawn_ws_upstream().await;
        let (proxy, _rx) = proxy_for(addr);

        proxy.handle_connect(&connect_frame(1, "/echo")).await;
        proxy.handle_connect(&connect_frame(2, "/echo")).await;
        assert_eq!(proxy.connection_count().await, 2);

        proxy.close_all().await;
        assert_eq!(proxy.connection_count().await, 0);
    }
}
