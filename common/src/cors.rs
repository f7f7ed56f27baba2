use http::{HeaderValue, Method, header::CONTENT_TYPE};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Fully permissive CORS for the public read surface (`/cell-last-edit`,
/// `/health`). The grid is world-readable; only methods are constrained.
pub fn permissive() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

/// Origin-pinned CORS for deployments that front the websocket with a
/// browser origin check.
pub fn pinned(origins: &[&str]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.iter().map(|o| {
            HeaderValue::from_str(o)
                .unwrap_or_else(|_| panic!("Invalid header value for CORS origin: {}", o))
        })))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60))
}
