// Tunnel agent supervisor.
//
// Owns the lifecycle state machine: try the WebRTC transport up to
// `max_p2p_attempts` times (each bounded by `p2p_timeout`, each attempt a
// fresh peer connection), fall back to the relay broker, and on any loss
// re-enter the cycle with exponential backoff. All transport state mutations
// happen here; the proxies only ever see the shared outbound channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::network::relay::RelayTransport;
use crate::network::signaling::SignalingClient;
use crate::network::transport::{ActiveTransport, ConnectionState, TransportMode};
use crate::network::webrtc::{default_ice_servers, IceServer, WebRtcTransport};
use crate::protocol::signal::{AckStatus, SignalMessage, TransportChoice};
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::http::HttpProxy;
use crate::proxy::router::{ClientResolver, Router};
use crate::proxy::ws::WsProxy;

pub const DEFAULT_MAX_P2P_ATTEMPTS: u32 = 3;
pub const DEFAULT_P2P_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AgentConfig {
    /// Signaling broker /signal endpoint (ws:// or wss://).
    pub signal_url: String,
    /// Relay broker base URL; the agent attaches at /relay/{device_id}.
    pub relay_url: String,
    pub device_id: String,
    pub token: String,
    /// Default local upstream the proxies terminate against.
    pub local_server_url: String,
    /// Set when this agent initiates the peer connection (it normally
    /// answers; the browser initiates).
    pub target_device_id: Option<String>,
    pub max_p2p_attempts: u32,
    pub p2p_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub ice_servers: Vec<IceServer>,
    pub client_resolver: Option<ClientResolver>,
}

impl AgentConfig {
    pub fn new(
        signal_url: impl Into<String>,
        relay_url: impl Into<String>,
        device_id: impl Into<String>,
        token: impl Into<String>,
        local_server_url: impl Into<String>,
    ) -> Self {
        Self {
            signal_url: signal_url.into(),
            relay_url: relay_url.into(),
            device_id: device_id.into(),
            token: token.into(),
            local_server_url: local_server_url.into(),
            target_device_id: None,
            max_p2p_attempts: DEFAULT_MAX_P2P_ATTEMPTS,
            p2p_timeout: DEFAULT_P2P_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            ice_servers: default_ice_servers(),
            client_resolver: None,
        }
    }
}

struct AgentShared {
    cfg: AgentConfig,
    state_tx: watch::Sender<ConnectionState>,
    active: Mutex<Option<ActiveTransport>>,
    current_p2p: Mutex<Option<Arc<WebRtcTransport>>>,
    peer_device_id: Mutex<Option<String>>,
    signal_tx: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    candidate_tx: mpsc::UnboundedSender<Value>,
    ws_proxy: Arc<WsProxy>,
    stop: CancellationToken,
}

impl AgentShared {
    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            info!("agent: state -> {}", state.as_str());
            self.state_tx.send(state).ok();
        }
    }

    async fn send_signal(&self, msg: SignalMessage) {
        let tx = self.signal_tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                tx.send(msg).ok();
            }
            None => debug!("agent: no signaling connection, dropping control message"),
        }
    }
}

/// Receivers handed to the background tasks exactly once, at start.
struct Boot {
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    candidate_rx: mpsc::UnboundedReceiver<Value>,
}

pub struct TunnelAgent {
    shared: Arc<AgentShared>,
    state_rx: watch::Receiver<ConnectionState>,
    dispatcher: Arc<Dispatcher>,
    boot: Mutex<Option<Boot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelAgent {
    pub fn new(cfg: AgentConfig) -> AppResult<Self> {
        let mut router = Router::new(&cfg.local_server_url);
        if let Some(resolver) = cfg.client_resolver.clone() {
            router = router.with_resolver(resolver);
        }
        let router = Arc::new(router);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();

        let http = Arc::new(HttpProxy::new(Arc::clone(&router))?);
        let ws_proxy = Arc::new(WsProxy::new(router, outbound_tx.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            http,
            Arc::clone(&ws_proxy),
            outbound_tx.clone(),
        ));

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(AgentShared {
            cfg,
            state_tx,
            active: Mutex::new(None),
            current_p2p: Mutex::new(None),
            peer_device_id: Mutex::new(None),
            signal_tx: Mutex::new(None),
            inbound_tx,
            candidate_tx,
            ws_proxy,
            stop: CancellationToken::new(),
        });

        Ok(Self {
            shared,
            state_rx,
            dispatcher,
            boot: Mutex::new(Some(Boot {
                inbound_rx,
                outbound_rx,
                candidate_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background tasks and begin the connect cycle.
    pub async fn start(&self) -> AppResult<()> {
        let Some(boot) = self.boot.lock().await.take() else {
            return Err(AppError::Network("agent already started".into()));
        };
        info!(
            "agent: starting (device {}, signal {})",
            self.shared.cfg.device_id, self.shared.cfg.signal_url
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(spawn_dispatch_loop(
            Arc::clone(&self.dispatcher),
            boot.inbound_rx,
            self.shared.stop.clone(),
        ));
        tasks.push(spawn_outbound_pump(
            Arc::clone(&self.shared),
            boot.outbound_rx,
        ));
        tasks.push(spawn_candidate_pump(
            Arc::clone(&self.shared),
            boot.candidate_rx,
        ));
        tasks.push(tokio::spawn(run_supervisor(Arc::clone(&self.shared))));
        Ok(())
    }

    /// Cooperative shutdown: disable reconnection, close the transport, then
    /// the proxies (cascading to their upstream sockets), then signaling.
    pub async fn stop(&self) {
        info!("agent: stopping");
        self.shared.stop.cancel();

        if let Some(active) = self.shared.active.lock().await.take() {
            active.close().await;
        }
        if let Some(p2p) = self.shared.current_p2p.lock().await.take() {
            p2p.close().await;
        }
        self.shared.ws_proxy.close_all().await;
        // Dropping the sender ends the signaling send pump, which closes the
        // broker connection on its way out.
        *self.shared.signal_tx.lock().await = None;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("agent: stopped");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn device_id(&self) -> &str {
        &self.shared.cfg.device_id
    }

    pub async fn transport_mode(&self) -> Option<TransportMode> {
        self.shared.active.lock().await.as_ref().map(|t| t.mode())
    }

    pub async fn data_channel_state(&self) -> Option<String> {
        match self.shared.active.lock().await.as_ref() {
            Some(ActiveTransport::P2p(t)) => Some(t.data_channel_state().await.to_string()),
            _ => None,
        }
    }

    /// Live WebSocket registrations held by the proxy (drains to zero after
    /// `stop()`).
    pub async fn ws_connection_count(&self) -> usize {
        self.shared.ws_proxy.connection_count().await
    }
}

fn spawn_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                frame = inbound_rx.recv() => match frame {
                    Some(frame) => dispatcher.dispatch(frame).await,
                    None => break,
                },
            }
        }
    })
}

fn spawn_outbound_pump(
    shared: Arc<AgentShared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shared.stop.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let active = shared.active.lock().await;
            match active.as_ref() {
                Some(transport) => {
                    if let Err(e) = transport.send(frame).await {
                        warn!("agent: outbound send failed, dropping frame: {e}");
                    }
                }
                None => {
                    drop(active);
                    // A response can beat the supervisor's bookkeeping by a
                    // moment when the data channel has just opened; try the
                    // in-progress attempt before dropping.
                    let attempt = shared.current_p2p.lock().await.clone();
                    match attempt {
                        Some(p2p) => {
                            if let Err(e) = p2p.send(frame).await {
                                warn!("agent: no active transport, dropping frame: {e}");
                            }
                        }
                        None => warn!("agent: no active transport, dropping outbound frame"),
                    }
                }
            }
        }
    })
}

fn spawn_candidate_pump(
    shared: Arc<AgentShared>,
    mut candidate_rx: mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = candidate_rx.recv().await {
            if shared.stop.is_cancelled() {
                break;
            }
            let target = {
                let peer = shared.peer_device_id.lock().await;
                peer.clone().or_else(|| shared.cfg.target_device_id.clone())
            };
            match target {
                Some(target_device_id) => {
                    debug!("agent: sending ICE candidate to {target_device_id}");
                    shared
                        .send_signal(SignalMessage::IceCandidate {
                            target_device_id,
                            sender_device_id: None,
                            payload,
                        })
                        .await;
                }
                None => debug!("agent: no peer to address ICE candidate to, dropping"),
            }
        }
    })
}

async fn run_supervisor(shared: Arc<AgentShared>) {
    let mut delay = shared.cfg.reconnect_delay;
    loop {
        if shared.stop.is_cancelled() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        match establish(&shared).await {
            Ok(link) => {
                shared.set_state(ConnectionState::Connected);
                // Backoff resets on a successful attach.
                delay = shared.cfg.reconnect_delay;

                let stopped = tokio::select! {
                    _ = link.loss.cancelled() => false,
                    _ = shared.stop.cancelled() => true,
                };
                link.teardown(&shared).await;
                if stopped {
                    break;
                }
                warn!("agent: transport lost");
                shared.set_state(ConnectionState::Failed);
            }
            Err(e) => {
                if shared.stop.is_cancelled() {
                    break;
                }
                warn!("agent: connect cycle failed: {e}");
                shared.set_state(ConnectionState::Failed);
            }
        }

        info!("agent: reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.stop.cancelled() => break,
        }
        delay = (delay * 2).min(shared.cfg.max_reconnect_delay);
    }
    shared.set_state(ConnectionState::Disconnected);
}

/// One established connect cycle: live signaling tasks plus the loss signal
/// of whichever transport came up.
struct Link {
    loss: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn teardown(&self, shared: &AgentShared) {
        for task in &self.tasks {
            task.abort();
        }
        *shared.signal_tx.lock().await = None;
        if let Some(active) = shared.active.lock().await.take() {
            active.close().await;
        }
        *shared.current_p2p.lock().await = None;
        *shared.peer_device_id.lock().await = None;
        // Connection ids belong to the dead transport; drop them all.
        shared.ws_proxy.close_all().await;
    }
}

async fn establish(shared: &Arc<AgentShared>) -> AppResult<Link> {
    let mut link = open_signaling(shared).await?;
    match bring_up_transport(shared).await {
        Ok(loss) => {
            link.loss = loss;
            Ok(link)
        }
        Err(e) => {
            link.teardown(shared).await;
            Err(e)
        }
    }
}

async fn open_signaling(shared: &Arc<AgentShared>) -> AppResult<Link> {
    let cfg = &shared.cfg;
    let client = SignalingClient::connect(&cfg.signal_url, &cfg.device_id, &cfg.token).await?;
    let (mut sink, mut stream) = client.split();

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalMessage>();
    *shared.signal_tx.lock().await = Some(signal_tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = signal_rx.recv().await {
            if sink.send(&msg).await.is_err() {
                break;
            }
        }
        sink.close().await;
    });

    let recv_shared = Arc::clone(shared);
    let recv_task = tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(msg) => handle_signal(&recv_shared, msg).await,
                Err(e) => {
                    debug!("agent: signaling receive ended: {e}");
                    break;
                }
            }
        }
    });

    Ok(Link {
        loss: CancellationToken::new(),
        tasks: vec![send_task, recv_task],
    })
}

async fn bring_up_transport(shared: &Arc<AgentShared>) -> AppResult<CancellationToken> {
    let cfg = &shared.cfg;

    for attempt in 1..=cfg.max_p2p_attempts {
        if shared.stop.is_cancelled() {
            return Err(AppError::Stopped);
        }
        info!("agent: p2p attempt {attempt}/{}", cfg.max_p2p_attempts);

        let transport = match WebRtcTransport::new(
            &cfg.ice_servers,
            shared.inbound_tx.clone(),
            shared.candidate_tx.clone(),
        )
        .await
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                warn!("agent: peer connection setup failed: {e}");
                continue;
            }
        };
        *shared.current_p2p.lock().await = Some(Arc::clone(&transport));

        // Normally the browser peer offers and we answer; with a configured
        // target this agent initiates instead.
        if let Some(target) = &cfg.target_device_id {
            match transport.initiate().await {
                Ok(offer) => {
                    shared
                        .send_signal(SignalMessage::Offer {
                            target_device_id: target.clone(),
                            sender_device_id: None,
                            payload: offer,
                        })
                        .await;
                }
                Err(e) => warn!("agent: offer creation failed: {e}"),
            }
        }

        match transport.wait_connected(cfg.p2p_timeout).await {
            Ok(()) => {
                info!("agent: p2p transport up");
                *shared.active.lock().await =
                    Some(ActiveTransport::P2p(Arc::clone(&transport)));
                return Ok(state_loss_token(transport.subscribe_state()));
            }
            Err(e) => {
                warn!("agent: p2p attempt {attempt} failed: {e}");
                // Full teardown before the next attempt.
                transport.close().await;
                *shared.current_p2p.lock().await = None;
            }
        }
    }

    if shared.stop.is_cancelled() {
        return Err(AppError::Stopped);
    }
    info!("agent: falling back to relay transport");
    let relay = RelayTransport::connect(
        &cfg.relay_url,
        &cfg.device_id,
        &cfg.token,
        shared.inbound_tx.clone(),
    )
    .await?;
    let relay = Arc::new(relay);
    let loss = relay.lost();
    *shared.active.lock().await = Some(ActiveTransport::Relay(relay));
    info!("agent: relay transport up (session {})", cfg.device_id);
    Ok(loss)
}

/// Cancelled once the watched transport reaches a terminal state.
fn state_loss_token(mut rx: watch::Receiver<ConnectionState>) -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        loop {
            let state = *rx.borrow();
            if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        signal.cancel();
    });
    token
}

async fn handle_signal(shared: &Arc<AgentShared>, msg: SignalMessage) {
    match msg {
        SignalMessage::Connected { device_id, .. } => {
            info!("agent: signaling attach confirmed for {device_id}");
        }

        SignalMessage::Offer {
            sender_device_id,
            payload,
            ..
        } => {
            if let Some(sender) = &sender_device_id {
                info!("agent: received offer from {sender}");
                *shared.peer_device_id.lock().await = Some(sender.clone());
            }
            // The offer can race the attempt's peer-connection setup by a few
            // milliseconds; wait for it rather than dropping the offer.
            let transport = wait_for_attempt(shared, Duration::from_secs(2)).await;
            let Some(transport) = transport else {
                warn!("agent: offer received but no p2p attempt in progress");
                return;
            };
            match transport.handle_offer(payload).await {
                Ok(answer) => {
                    if let Some(target) = sender_device_id {
                        shared
                            .send_signal(SignalMessage::Answer {
                                target_device_id: target.clone(),
                                sender_device_id: None,
                                payload: answer,
                            })
                            .await;
                        info!("agent: sent answer to {target}");
                    }
                }
                Err(e) => warn!("agent: answering offer failed: {e}"),
            }
        }

        SignalMessage::Answer { payload, .. } => {
            let transport = shared.current_p2p.lock().await.clone();
            match transport {
                Some(transport) => {
                    if let Err(e) = transport.handle_answer(payload).await {
                        warn!("agent: applying answer failed: {e}");
                    }
                }
                None => warn!("agent: answer received but no p2p attempt in progress"),
            }
        }

        SignalMessage::IceCandidate {
            sender_device_id,
            payload,
            ..
        } => {
            if let Some(sender) = sender_device_id {
                let mut peer = shared.peer_device_id.lock().await;
                peer.get_or_insert(sender);
            }
            let transport = shared.current_p2p.lock().await.clone();
            match transport {
                Some(transport) => {
                    if let Err(e) = transport.add_ice_candidate(payload).await {
                        warn!("agent: adding candidate failed: {e}");
                    }
                }
                None => debug!("agent: candidate received with no p2p attempt, dropping"),
            }
        }

        SignalMessage::ConnectRequestReceived {
            from_device_id,
            preferred_transport,
            ..
        } => {
            info!(
                "agent: connect request from {from_device_id} (preferred {preferred_transport:?})"
            );
            *shared.peer_device_id.lock().await = Some(from_device_id.clone());

            let relayed = shared
                .active
                .lock()
                .await
                .as_ref()
                .is_some_and(|t| t.is_relayed());
            let transport = if relayed {
                TransportChoice::Relay
            } else {
                TransportChoice::Webrtc
            };
            shared
                .send_signal(SignalMessage::ConnectAck {
                    target_device_id: from_device_id,
                    transport,
                    status: AckStatus::Connecting,
                    relay_session_id: Some(shared.cfg.device_id.clone()),
                    sender_device_id: None,
                })
                .await;
        }

        SignalMessage::ConnectAckReceived {
            from_device_id,
            transport,
            status,
            ..
        } => {
            info!("agent: connect ack from {from_device_id}: {transport:?}/{status:?}");
        }

        SignalMessage::Ack { message } => debug!("agent: signaling ack: {message}"),
        SignalMessage::Error { message } => warn!("agent: signaling error: {message}"),

        other => debug!("agent: ignoring signaling message: {other:?}"),
    }
}

async fn wait_for_attempt(
    shared: &AgentShared,
    deadline: Duration,
) -> Option<Arc<WebRtcTransport>> {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(transport) = shared.current_p2p.lock().await.clone() {
            return Some(transport);
        }
        if start.elapsed() >= deadline || shared.stop.is_cancelled() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> AgentConfig {
        let mut cfg = AgentConfig::new(
            // Nothing listens on port 9.
            "ws://127.0.0.1:9/signal",
            "ws://127.0.0.1:9",
            "dev-test",
            "tok",
            "http://127.0.0.1:9",
        );
        cfg.max_p2p_attempts = 0;
        cfg.reconnect_delay = Duration::from_millis(50);
        cfg.max_reconnect_delay = Duration::from_millis(200);
        cfg
    }

    #[tokio::test]
    async fn unreachable_brokers_keep_agent_in_retry_cycle() {
        let agent = TunnelAgent::new(unreachable_config()).unwrap();
        agent.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            agent.state(),
            ConnectionState::Connecting | ConnectionState::Failed
        ));

        agent.stop().await;
        assert_eq!(agent.state(), ConnectionState::Disconnected);
        assert_eq!(agent.ws_connection_count().await, 0);
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let agent = TunnelAgent::new(unreachable_config()).unwrap();
        agent.start().await.unwrap();
        assert!(agent.start().await.is_err());
        agent.stop().await;
    }
}
