pub mod error;
mod handlers;
pub mod origin;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::gateway::Gateway;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub shutdown: ShutdownCoordinator,
    /// Open WebSocket connections, bounded by `max_channels`.
    pub channel_count: Arc<AtomicUsize>,
    pub max_channels: usize,
}

impl AppState {
    pub fn new(gateway: Gateway, shutdown: ShutdownCoordinator, max_channels: usize) -> Self {
        Self {
            gateway,
            shutdown,
            channel_count: Arc::new(AtomicUsize::new(0)),
            max_channels,
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a localhost-only setup.
pub struct RouterConfig {
    pub bind: SocketAddr,
    /// Extra browser origins allowed to open a WebSocket and call the HTTP
    /// API cross-origin. `"*"` allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            allowed_origins: vec![],
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let port = config.bind.port();
    let mut allowed_origins = vec![
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
        format!("http://[::1]:{}", port),
    ];
    allowed_origins.extend(config.allowed_origins.iter().cloned());

    let relay = Router::new()
        .route("/", get(ws_relay))
        .route("/ws", get(ws_relay))
        .route("/api/exec", post(exec))
        .layer(axum::middleware::from_fn(move |req, next| {
            let origins = allowed_origins.clone();
            origin::check_ws_origin(origins, req, next)
        }));

    let router = Router::new()
        .route("/health", get(health))
        .merge(relay)
        .with_state(state)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    if config.allowed_origins.is_empty() {
        return router;
    }

    let allow_origin = if config
        .allowed_origins
        .iter()
        .any(|o| o == origin::ANY_ORIGIN)
    {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    router.layer(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]),
    )
}
