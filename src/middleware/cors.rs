use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};

/// `origins` is a comma-separated list; `*` allows any origin without credentials
pub fn create_cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .max_age(std::time::Duration::from_secs(60 * 60)); // 1 hour

    if origins.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();

    layer.allow_origin(allowed).allow_credentials(true)
}
