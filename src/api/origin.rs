use axum::{extract::Request, middleware::Next, response::Response};
use super::error::ApiError;

/// Allows any browser origin when present in the allow list.
pub const ANY_ORIGIN: &str = "*";

/// Check the Origin header on WebSocket upgrade requests.
///
/// A relay that opens SSH sessions on behalf of the caller must not be
/// drivable from arbitrary web pages (CSWSH).
///
/// - Non-WebSocket requests: pass through (CORS handles HTTP)
/// - No Origin header: pass through (non-browser clients)
/// - Origin in the allow list, or the list contains `"*"`: pass through
/// - Otherwise: reject with 403
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let is_ws_upgrade = req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.to_string(),
    };

    if allowed_origins
        .iter()
        .any(|allowed| allowed == ANY_ORIGIN || allowed == &origin)
    {
        return Ok(next.run(req).await);
    }

    tracing::warn!(%origin, "rejected WebSocket upgrade from disallowed origin");
    Err(ApiError::OriginNotAllowed)
}
