// Per-request target resolution.
//
// A `?client=<id>` query selector routes to a co-located client UI resolved
// through an injected discovery capability; everything else goes to the
// default local upstream. Stateless and shared freely across tasks.

use std::sync::Arc;

use tracing::{debug, warn};

/// Pluggable discovery of a client id to its base URL.
pub type ClientResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct Router {
    default_upstream: String,
    resolve_client: Option<ClientResolver>,
}

impl Router {
    pub fn new(default_upstream: impl Into<String>) -> Self {
        let default_upstream = default_upstream.into().trim_end_matches('/').to_string();
        Self {
            default_upstream,
            resolve_client: None,
        }
    }

    pub fn with_resolver(mut self, resolver: ClientResolver) -> Self {
        self.resolve_client = Some(resolver);
        self
    }

    pub fn default_upstream(&self) -> &str {
        &self.default_upstream
    }

    /// Determine the target base URL for a request path (query string included).
    pub fn route(&self, path: &str) -> String {
        if let Some(client_id) = first_client_param(path) {
            debug!("router: request selects client '{client_id}'");
            if let Some(resolver) = &self.resolve_client {
                if let Some(base) = resolver(&client_id) {
                    return base.trim_end_matches('/').to_string();
                }
            }
            warn!("router: client '{client_id}' not resolvable, using default upstream");
        }
        self.default_upstream.clone()
    }
}

/// First value of the `client` query parameter, if the path carries one.
fn first_client_param(path: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "client")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_dash() -> Router {
        Router::new("http://localhost:5142/").with_resolver(Arc::new(|id: &str| {
            (id == "dash").then(|| "http://127.0.0.1:33801/".to_string())
        }))
    }

    #[test]
    fn plain_path_routes_to_default() {
        let router = Router::new("http://localhost:5142");
        assert_eq!(router.route("/v1/health"), "http://localhost:5142");
    }

    #[test]
    fn client_param_routes_to_resolved_base() {
        let router = router_with_dash();
        assert_eq!(
            router.route("/index.html?client=dash"),
            "http://127.0.0.1:33801"
        );
    }

    #[test]
    fn unknown_client_falls_back_to_default() {
        let router = router_with_dash();
        assert_eq!(
            router.route("/v1/runners?client=unknown"),
            "http://localhost:5142"
        );
    }

    #[test]
    fn first_client_value_wins() {
        let router = router_with_dash();
        assert_eq!(
            router.route("/x?client=dash&client=other"),
            "http://127.0.0.1:33801"
        );
    }

    #[test]
    fn no_resolver_means_default() {
        let router = Router::new("http://localhost:5142");
        assert_eq!(router.route("/x?client=dash"), "http://localhost:5142");
    }

    #[test]
    fn routing_is_idempotent() {
        let router = router_with_dash();
        let first = router.route("/a?client=dash");
        assert_eq!(router.route("/a?client=dash"), first);
    }
}
