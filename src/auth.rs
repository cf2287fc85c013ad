//! API key checks and per-connection anti-forgery tokens.
//!
//! The API key lives in a secret file (see [`crate::secrets`]) and is re-read
//! on every check. HTTP routes accept it as `Authorization: Bearer <key>` or
//! as the `termgate_key` cookie, because a browser cannot set headers on the
//! iframe that loads the proxied desktop. WebSocket connections present it in
//! the `handshake` message instead and receive a CSRF token that every later
//! mutating message must echo.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use rand::RngCore;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::secrets::SecretStore;

/// Name of the cookie that may carry the API key on HTTP routes.
pub const KEY_COOKIE: &str = "termgate_key";

/// Axum middleware that rejects requests without a valid API key. The
/// [`SecretStore`] is injected via an `Extension` layer.
///
/// # Error responses
///
/// - `401 Unauthorized` — no key supplied, key file missing, or key mismatch
/// - `500 Internal Server Error` — [`SecretStore`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(secrets) = request.extensions().get::<SecretStore>().cloned() else {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
        )
            .into_response();
    };

    let Some(provided) = provided_key(request.headers()) else {
        return GatewayError::AuthenticationRejected.into_response();
    };

    match secrets.api_key().await {
        Some(expected) if constant_time_eq(expected.as_bytes(), provided.as_bytes()) => {
            next.run(request).await
        }
        _ => GatewayError::AuthenticationRejected.into_response(),
    }
}

/// Extract the API key from the bearer header, falling back to the cookie.
fn provided_key(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == KEY_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Opaque identity of one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Token table: one CSRF token per authenticated connection.
///
/// Cloneable: all clones share the same table. The lock is only held for
/// the map operation itself.
#[derive(Clone, Default)]
pub struct CsrfTokens {
    tokens: Arc<Mutex<HashMap<ConnectionId, String>>>,
}

impl CsrfTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `conn`. A connection that already holds one gets the
    /// same token back.
    pub async fn issue(&self, conn: ConnectionId) -> String {
        let mut tokens = self.tokens.lock().await;
        tokens.entry(conn).or_insert_with(generate_token).clone()
    }

    /// Whether `provided` equals the token currently held by `conn`.
    pub async fn validate(&self, conn: ConnectionId, provided: &str) -> bool {
        let tokens = self.tokens.lock().await;
        tokens
            .get(&conn)
            .is_some_and(|t| constant_time_eq(t.as_bytes(), provided.as_bytes()))
    }

    /// Discard the token of a closed connection.
    pub async fn revoke(&self, conn: ConnectionId) {
        self.tokens.lock().await.remove(&conn);
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 256 random bits from the OS, URL-safe base64.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
