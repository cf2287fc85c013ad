//! Gateway error taxonomy.
//!
//! Every failure that reaches a client goes through [`GatewayError`]: over the
//! control channel it becomes an `error{message, code}` event, over HTTP it
//! becomes a JSON body `{"error": ..., "code": ...}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing API key, or the key file could not be read.
    #[error("authentication rejected")]
    AuthenticationRejected,
    /// Mutating message without the connection's current token.
    #[error("invalid or missing CSRF token")]
    CsrfRejected,
    /// Message arrived before a successful handshake.
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("invalid session name: {0:?}")]
    InvalidSessionName(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("terminal {0} is not attached")]
    SlotNotFound(u32),
    #[error("failed to create session {name}: {reason}")]
    SessionCreateFailed { name: String, reason: String },
    /// PTY allocation or controller spawn failed.
    #[error("terminal error: {0}")]
    Pty(String),
    /// Readiness polling exhausted, tunnel open failed, or the backend
    /// credential is missing.
    #[error("desktop backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("upstream request failed: {0}")]
    ProxyUpstreamError(String),
    #[error("no desktop tunnel is open")]
    NoTunnel,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl GatewayError {
    /// Stable machine-readable code sent alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRejected => "AUTHENTICATION_REJECTED",
            Self::CsrfRejected => "CSRF_REJECTED",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::InvalidSessionName(_) => "INVALID_SESSION_NAME",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SlotNotFound(_) => "SLOT_NOT_FOUND",
            Self::SessionCreateFailed { .. } => "SESSION_CREATE_FAILED",
            Self::Pty(_) => "PTY_ERROR",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::ProxyUpstreamError(_) => "PROXY_UPSTREAM_ERROR",
            Self::NoTunnel => "NO_TUNNEL",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationRejected | Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::CsrfRejected => StatusCode::FORBIDDEN,
            Self::InvalidSessionName(_) | Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) | Self::SlotNotFound(_) | Self::NoTunnel => {
                StatusCode::NOT_FOUND
            }
            Self::SessionCreateFailed { .. } | Self::Pty(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProxyUpstreamError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}
