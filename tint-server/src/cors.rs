use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

/// Wildcard CORS unless a comma separated origin list is configured.
/// The wildcard is meant for development only.
pub fn cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);

    let origins: Vec<HeaderValue> = allowed_origins
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!(origin = s, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
