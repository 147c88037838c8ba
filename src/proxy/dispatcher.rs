// Frame dispatch — the first byte of an inbound frame selects the engine.
//
// HTTP requests run in their own task so in-flight requests overlap and
// responses come back in completion order. WebSocket frames are handled
// inline: WS_CONNECT must finish registering before the WS_DATA behind it is
// looked up.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::frame::FrameKind;
use crate::proxy::http::HttpProxy;
use crate::proxy::ws::WsProxy;

pub struct Dispatcher {
    http: Arc<HttpProxy>,
    ws: Arc<WsProxy>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Dispatcher {
    pub fn new(
        http: Arc<HttpProxy>,
        ws: Arc<WsProxy>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self { http, ws, outbound }
    }

    /// Route one complete inbound frame. Never closes the transport: protocol
    /// violations are logged and the frame dropped.
    pub async fn dispatch(&self, data: Vec<u8>) {
        let Some(&first) = data.first() else {
            warn!("dispatcher: empty frame, dropping");
            return;
        };

        match FrameKind::from_byte(first) {
            Some(FrameKind::HttpRequest) => {
                let http = Arc::clone(&self.http);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let response = http.handle(&data).await;
                    outbound.send(response).ok();
                });
            }
            Some(FrameKind::HttpResponse) => {
                warn!("dispatcher: unexpected HTTP_RESPONSE frame from peer, dropping");
            }
            Some(FrameKind::WsConnect) => self.ws.handle_connect(&data).await,
            Some(FrameKind::WsData) => self.ws.handle_data(&data).await,
            Some(FrameKind::WsClose) => self.ws.handle_close(&data).await,
            None => {
                warn!("dispatcher: unknown frame kind 0x{first:02x}, dropping");
            }
        }
    }
}
