//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an endpoint group. All handlers except
//! [`health`] and the WebSocket upgrade require the API key via the
//! [`crate::auth::require_api_key`] middleware.

pub mod health;
pub mod proxy;
pub mod sessions;

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{any, get},
    Extension, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth, ws, AppState};

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let mount = state.config.desktop.mount().to_string();

    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/ws", get(ws::ws_upgrade));

    let proxy_routes = Router::new()
        .route(&mount, any(proxy::proxy))
        .route(&format!("{mount}/{{*path}}"), any(proxy::proxy))
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.server.max_proxy_requests.max(1),
        ));

    let authed_routes = Router::new()
        .route("/", get(sessions::index))
        .route("/history/{session}", get(sessions::history))
        .merge(proxy_routes)
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(state.secrets.clone()))
        .layer(middleware::from_fn(no_cache))
        .layer(cors_layer(&state.config.server.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Mark every response as uncacheable.
async fn no_cache(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {o:?}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
