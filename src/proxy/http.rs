// HTTP proxy engine — terminates HTTP_REQUEST frames against local upstreams.
//
// Exactly one HTTP_RESPONSE frame is produced per request frame, carrying the
// same request_id. Upstream failures are shaped into 502/500 responses so the
// remote peer always sees a well-formed answer.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::protocol::frame::{peek_frame_id, HeaderMap, HttpRequestFrame, HttpResponseFrame};
use crate::proxy::router::Router;

/// Total per-request deadline against the upstream.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpProxy {
    router: Arc<Router>,
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(router: Arc<Router>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| AppError::Upstream(format!("http client: {e}")))?;
        Ok(Self { router, client })
    }

    /// Handle one HTTP_REQUEST frame, returning the encoded response frame.
    pub async fn handle(&self, data: &[u8]) -> Vec<u8> {
        let frame = match HttpRequestFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("http proxy: undecodable request frame: {e}");
                let request_id = peek_frame_id(data).unwrap_or(0);
                return error_frame(request_id, 500, format!("Internal Server Error: {e}"))
                    .encode();
            }
        };

        info!(
            "http proxy: request {} {} {}",
            frame.request_id, frame.method, frame.path
        );
        let response = self.forward(frame).await;
        info!(
            "http proxy: response {} -> {}",
            response.request_id, response.status
        );
        response.encode()
    }

    async fn forward(&self, frame: HttpRequestFrame) -> HttpResponseFrame {
        let request_id = frame.request_id;

        let method = match reqwest::Method::from_bytes(frame.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                return error_frame(
                    request_id,
                    500,
                    format!("Internal Server Error: invalid method: {e}"),
                )
            }
        };

        let target = self.router.route(&frame.path);
        let url = format!("{target}{}", frame.path);
        debug!("http proxy: forwarding {request_id} to {url}");

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &frame.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("http proxy: dropping unrepresentable header '{name}'"),
            }
        }

        let sent = self
            .client
            .request(method, url.as_str())
            .headers(headers)
            .body(frame.body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => return error_frame(request_id, 502, format!("Bad Gateway: {e}")),
        };

        let status = response.status().as_u16();
        let mut out_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(value) => {
                    out_headers.insert(name.as_str().to_string(), value.to_string());
                }
                Err(_) => warn!("http proxy: dropping non-UTF-8 response header '{name}'"),
            }
        }

        match response.bytes().await {
            Ok(body) => HttpResponseFrame {
                request_id,
                status,
                headers: out_headers,
                body: body.to_vec(),
            },
            Err(e) => error_frame(request_id, 502, format!("Bad Gateway: {e}")),
        }
    }
}

fn error_frame(request_id: u32, status: u16, detail: String) -> HttpResponseFrame {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    HttpResponseFrame {
        request_id,
        status,
        headers,
        body: serde_json::to_vec(&serde_json::json!({ "error": detail })).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameKind;
    use axum::routing::get;
    use std::net::SocketAddr;

    async fn spawn_upstream(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn proxy_for(addr: SocketAddr) -> HttpProxy {
        HttpProxy::new(Arc::new(Router::new(format!("http://{addr}")))).unwrap()
    }

    fn get_frame(request_id: u32, path: &str) -> Vec<u8> {
        HttpRequestFrame {
            request_id,
            method: "GET".into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
        .encode()
    }

    #[tokio::test]
    async fn health_roundtrip() {
        let app = axum::Router::new().route(
            "/health",
            get(|| async { axum::Json(serde_json::json!({"status": "ok"})) }),
        );
        let addr = spawn_upstream(app).await;
        let proxy = proxy_for(addr);

        let response = proxy.handle(&get_frame(1, "/health")).await;
        let frame = HttpResponseFrame::decode(&response).unwrap();

        assert_eq!(frame.request_id, 1);
        assert_eq!(frame.status, 200);
        assert_eq!(frame.body, br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn post_body_and_headers_are_forwarded() {
        use axum::http::HeaderMap as AxumHeaders;

        let app = axum::Router::new().route(
            "/echo",
            axum::routing::post(|headers: AxumHeaders, body: String| async move {
                let tag = headers
                    .get("x-burrow-test")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("missing")
                    .to_string();
                format!("{tag}:{body}")
            }),
        );
        let addr = spawn_upstream(app).await;
        let proxy = proxy_for(addr);

        let mut headers = HeaderMap::new();
        headers.insert("x-burrow-test".to_string(), "tagged".to_string());
        let request = HttpRequestFrame {
            request_id: 11,
            method: "POST".into(),
            path: "/echo".into(),
            headers,
            body: b"payload".to_vec(),
        };

        let frame = HttpResponseFrame::decode(&proxy.handle(&request.encode()).await).unwrap();
        assert_eq!(frame.status, 200);
        assert_eq!(frame.body, b"tagged:payload");
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_502() {
        // Nothing listens on port 9; connection is refused immediately.
        let proxy = HttpProxy::new(Arc::new(Router::new("http://127.0.0.1:9"))).unwrap();

        let frame = HttpResponseFrame::decode(&proxy.handle(&get_frame(77, "/x")).await).unwrap();
        assert_eq!(frame.request_id, 77);
        assert_eq!(frame.status, 502);
        let body = String::from_utf8(frame.body).unwrap();
        assert!(body.contains("Bad Gateway"), "got: {body}");
    }

    #[tokio::test]
    async fn malformed_frame_yields_500_with_best_effort_id() {
        let proxy = HttpProxy::new(Arc::new(Router::new("http://127.0.0.1:9"))).unwrap();

        // Kind byte + id, then garbage instead of the method length.
        let mut data = vec![FrameKind::HttpRequest as u8];
        data.extend_from_slice(&9u32.to_be_bytes());
        data.push(0xff);

        let frame = HttpResponseFrame::decode(&proxy.handle(&data).await).unwrap();
        assert_eq!(frame.request_id, 9);
        assert_eq!(frame.status, 500);
        let body = String::from_utf8(frame.body).unwrap();
        assert!(body.contains("Internal Server Error"), "got: {body}");
    }

    #[tokio::test]
    async fn upstream_status_is_passed_through() {
        let app = axum::Router::new().route(
            "/missing",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope") }),
        );
        let addr = spawn_upstream(app).await;
        let proxy = proxy_for(addr);

        let frame =
            HttpResponseFrame::decode(&proxy.handle(&get_frame(5, "/missing")).await).unwrap();
        assert_eq!(frame.status, 404);
        assert_eq!(frame.body, b"nope");
    }
}
