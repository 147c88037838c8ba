// Relay transport — the fallback data plane when no direct channel comes up.
//
// A binary WebSocket to the relay broker at /relay/{session_id}. Every binary
// message is one multiplex frame, carried verbatim; the broker pairs two
// peers under the session id and pumps bytes both ways without looking at
// them.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::network::signaling::WsStream;

pub struct RelayTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: JoinHandle<()>,
    lost: CancellationToken,
}

impl RelayTransport {
    /// Connect to the relay broker and start delivering inbound frames to
    /// `inbound`. The returned transport reports loss via [`Self::lost`].
    pub async fn connect(
        relay_url: &str,
        session_id: &str,
        token: &str,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> AppResult<Self> {
        let base = relay_url.trim_end_matches('/');
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .finish();
        let url = format!("{base}/relay/{session_id}?{query}");
        info!("relay: connecting to {base}/relay/{session_id}");

        let (ws, _response) = connect_async(&url)
            .await
            .map_err(|e| AppError::WebSocket(format!("relay connect: {e}")))?;
        info!("relay: connected");

        let (sink, mut stream) = ws.split();
        let lost = CancellationToken::new();

        let reader_lost = lost.clone();
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        debug!("relay: received {} bytes", data.len());
                        if inbound.send(data.to_vec()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // The broker may surface a JSON error as text.
                        debug!("relay: ignoring text message: {text}");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay: connection closed by server");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("relay: receive error: {e}");
                        break;
                    }
                }
            }
            reader_lost.cancel();
        });

        Ok(Self {
            sink: Mutex::new(sink),
            reader,
            lost,
        })
    }

    /// Send one multiplex frame as a binary message.
    pub async fn send(&self, data: Vec<u8>) -> AppResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| AppError::WebSocket(format!("relay send: {e}")))?;
        Ok(())
    }

    /// Cancelled when the relay socket is gone (server close or error).
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub async fn close(&self) {
        self.reader.abort();
        self.sink.lock().await.close().await.ok();
        self.lost.cancel();
    }
}
