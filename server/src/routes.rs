use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    routing::get,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::chat::{history, push};
use crate::longpoll::handler as longpoll_handler;
use crate::presence::routes as presence_routes;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Cross-origin settings for browser clients. Exposed in `push-hub.toml`
/// under the `[cors]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to call the API; `"*"` allows any (default: ["*"])
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Allow cookies and credentials; needs explicit origins (default: false)
    #[serde(default)]
    pub allow_credentials: bool,

    /// How long browsers may cache a preflight answer (default: 43200)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            allow_credentials: false,
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_age_secs() -> u64 {
    12 * 60 * 60
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    /// Origins that are not valid header values.
    pub fn invalid_origins(&self) -> Vec<&str> {
        self.allowed_origins
            .iter()
            .filter(|o| *o != "*" && HeaderValue::from_str(o).is_err())
            .map(String::as_str)
            .collect()
    }

    fn layer(&self) -> CorsLayer {
        let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::ORIGIN,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
                request_id.clone(),
            ])
            .expose_headers([header::CONTENT_LENGTH, request_id])
            .max_age(Duration::from_secs(self.max_age_secs));

        if self.allows_any_origin() {
            return layer.allow_origin(Any);
        }
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(self.allow_credentials)
    }
}

/// Build the full axum Router with all routes.
///
/// Every request gets an `x-request-id` (kept when the client sent one),
/// echoed on the response and recorded on the request's tracing span.
pub fn build_router(state: AppState) -> Router {
    // Client transports
    let transport_routes = Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/longpoll", get(longpoll_handler::long_poll))
        .route("/send", post(longpoll_handler::send_to_waiter));

    // Upstream ingestion and queries
    let api_routes = Router::new()
        .route("/api/push", post(push::push_message))
        .route("/api/messages", get(history::get_history))
        .route("/api/presence/online", get(presence_routes::list_online))
        .route("/api/presence/{user_id}", get(presence_routes::get_presence))
        .route("/api/hub/stats", get(hub_stats));

    let health = Router::new()
        .route("/health", get(health_check))
        .route("/ping", get(ping))
        .route("/services", get(services));

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let trace = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO));
    let cors = state.config.cors.layer();

    Router::new()
        .merge(transport_routes)
        .merge(api_routes)
        .merge(health)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(trace)
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

async fn ping() -> Json<Value> {
    Json(json!({"message": "pong"}))
}

async fn services() -> Json<Value> {
    Json(json!({"services": ["ws", "longpoll", "api"]}))
}

/// GET /api/hub/stats
async fn hub_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "instance_id": state.hub.instance_id(),
        "hub": state.hub.stats(),
        "long_poll_waiting": state.longpoll.len(),
    }))
}
