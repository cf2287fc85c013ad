//! Control-channel message types.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. Unknown
//! events and malformed payloads fail to deserialize and are answered with an
//! `INVALID_MESSAGE` error.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::terminal::SessionKind;

fn default_terminal() -> u32 {
    1
}

/// Client → gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        api_key: String,
    },
    GetSessions {
        #[serde(default)]
        csrf_token: String,
    },
    CreateSession {
        #[serde(default)]
        csrf_token: String,
        #[serde(rename = "type", default)]
        kind: SessionKind,
        #[serde(default)]
        name: Option<String>,
    },
    AttachSession {
        #[serde(default)]
        csrf_token: String,
        session: String,
        #[serde(default = "default_terminal")]
        terminal: u32,
    },
    Input {
        #[serde(default)]
        csrf_token: String,
        #[serde(default = "default_terminal")]
        terminal: u32,
        data: String,
    },
    Resize {
        #[serde(default)]
        csrf_token: String,
        #[serde(default = "default_terminal")]
        terminal: u32,
        rows: u16,
        cols: u16,
    },
    CloseSession {
        #[serde(default)]
        csrf_token: String,
        session: String,
    },
    RestartDesktop {
        #[serde(default)]
        csrf_token: String,
    },
    TunnelOpen {
        #[serde(default)]
        csrf_token: String,
        path: String,
    },
    /// Relayed as-is over an already-open tunnel; no token required.
    TunnelSend {
        data: String,
        #[serde(default)]
        binary: bool,
    },
}

impl ClientMessage {
    /// Token carried by a mutating message. `None` for messages that are not
    /// token-checked.
    pub fn csrf_token(&self) -> Option<&str> {
        match self {
            Self::Handshake { .. } | Self::TunnelSend { .. } => None,
            Self::GetSessions { csrf_token }
            | Self::CreateSession { csrf_token, .. }
            | Self::AttachSession { csrf_token, .. }
            | Self::Input { csrf_token, .. }
            | Self::Resize { csrf_token, .. }
            | Self::CloseSession { csrf_token, .. }
            | Self::RestartDesktop { csrf_token }
            | Self::TunnelOpen { csrf_token, .. } => Some(csrf_token),
        }
    }

    /// Event name, for logs.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::GetSessions { .. } => "get_sessions",
            Self::CreateSession { .. } => "create_session",
            Self::AttachSession { .. } => "attach_session",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::CloseSession { .. } => "close_session",
            Self::RestartDesktop { .. } => "restart_desktop",
            Self::TunnelOpen { .. } => "tunnel_open",
            Self::TunnelSend { .. } => "tunnel_send",
        }
    }
}

/// Gateway → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { csrf_token: String },
    SessionsList { sessions: Vec<String> },
    SessionCreated { name: String },
    Output { terminal: u32, data: String },
    SessionClosed { session: String },
    /// The tunnel requested by `tunnel_open` is live; frames queued while it
    /// was opening have been relayed.
    TunnelOpened { path: String },
    TunnelData { data: String, binary: bool },
    DesktopRestarted,
    DesktopRestartError { error: String },
    Error { message: String, code: String },
}

impl From<&GatewayError> for ServerMessage {
    fn from(err: &GatewayError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

impl From<GatewayError> for ServerMessage {
    fn from(err: GatewayError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_session_reads_type_field() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "event": "create_session",
            "data": {"csrf_token": "t", "type": "agent-unchained"}
        }))
        .unwrap();
        match msg {
            ClientMessage::CreateSession { kind, name, .. } => {
                assert_eq!(kind, SessionKind::AgentUnchained);
                assert!(name.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_token_reads_as_empty() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "event": "close_session",
            "data": {"session": "Shell"}
        }))
        .unwrap();
        assert_eq!(msg.csrf_token(), Some(""));
    }

    #[test]
    fn test_tunnel_send_is_not_token_checked() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "event": "tunnel_send",
            "data": {"data": "hello"}
        }))
        .unwrap();
        assert!(msg.csrf_token().is_none());
        assert_eq!(msg.event(), "tunnel_send");
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_value(json!({"event": "format_disk", "data": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_framing() {
        let value = serde_json::to_value(ServerMessage::Output {
            terminal: 2,
            data: "hi".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"event": "output", "data": {"terminal": 2, "data": "hi"}}));

        let value = serde_json::to_value(ServerMessage::DesktopRestarted).unwrap();
        assert_eq!(value, json!({"event": "desktop_restarted"}));

        let value = serde_json::to_value(ServerMessage::TunnelOpened {
            path: "websockify".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"event": "tunnel_opened", "data": {"path": "websockify"}}));
    }

    #[test]
    fn test_error_carries_code() {
        let msg = ServerMessage::from(GatewayError::SlotNotFound(3));
        assert_eq!(
            msg,
            ServerMessage::Error {
                message: "terminal 3 is not attached".into(),
                code: "SLOT_NOT_FOUND".into(),
            }
        );
    }
}
