//! `* /proxy/{*path}` — reverse proxy to the desktop backend.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;

/// Forward any method under the mount path to the desktop, rewriting
/// HTML/JS/CSS so the application works from the prefix.
///
/// Answers `503` while the desktop is still starting.
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mount = state.desktop.mount();
    let path = uri.path().strip_prefix(mount).unwrap_or(uri.path());

    if !state.desktop.ready_for_forwarding().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Desktop is starting, please retry in a few seconds",
        )
            .into_response();
    }

    match state
        .desktop
        .forward_http(method, path, uri.query(), &headers, body)
        .await
    {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!("Proxy {path} failed: {e}");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::tests::spawn_backend;
    use crate::state::tests::{test_state, test_state_with_desktop};
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn request(state: AppState, uri: &str) -> Response {
        crate::routes::router(state)
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header(header::AUTHORIZATION, "Bearer test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_starting_desktop_answers_503() {
        let dir = tempfile::tempdir().unwrap();
        let response = request(test_state(dir.path()), "/proxy/page").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("starting"));
    }

    #[tokio::test]
    async fn test_page_is_proxied_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let backend = spawn_backend(1).await;
        let state = test_state_with_desktop(dir.path(), &backend.url);

        let response = request(state.clone(), "/proxy/page?x=1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store, no-cache, must-revalidate, max-age=0"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(r#"src="/proxy/logo.png""#));
        assert!(state.desktop.is_ready());
    }
}
