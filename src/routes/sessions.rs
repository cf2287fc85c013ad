//! Session listing and scrollback.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::AppState;

/// `GET /` — backend session names for the client's landing view.
pub async fn index(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.terminals.list_sessions().await;
    Json(json!({ "sessions": sessions }))
}

/// `GET /history/{session}` — captured scrollback of one backend session.
///
/// # Errors
///
/// - `400` — session name outside `[A-Za-z0-9_-]`
/// - `404` — no such session
pub async fn history(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let history = state.terminals.capture(&session).await?;
    Ok(Json(json!({ "session": session, "history": history })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::terminal::SessionKind;

    #[tokio::test]
    async fn test_history_of_existing_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .terminals
            .create_session(SessionKind::Plain, None)
            .await
            .unwrap();
        std::fs::write(dir.path().join("sessions/Shell"), "$ make\nok\n").unwrap();

        let Json(body) = history(State(state), Path("Shell".to_string()))
            .await
            .unwrap();
        assert_eq!(body["session"], "Shell");
        assert_eq!(body["history"], "$ make\nok\n");
    }

    #[tokio::test]
    async fn test_history_rejects_bad_names_and_missing_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        assert!(matches!(
            history(State(state.clone()), Path("a:b".to_string())).await,
            Err(GatewayError::InvalidSessionName(_))
        ));
        assert!(matches!(
            history(State(state), Path("Ghost".to_string())).await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }
}
