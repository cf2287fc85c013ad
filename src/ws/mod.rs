//! WebSocket control channel.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws` and sends `handshake{api_key}`. A wrong or
//!    missing key is answered with an error and the socket is closed.
//! 2. On success the client gets `connected{csrf_token}`. Every mutating
//!    message after that must carry the token.
//! 3. Messages are processed one at a time. Terminal output and tunnel
//!    frames are produced by pump workers and merged into the same outbound
//!    queue, so a slow slot never stalls the control loop.
//! 4. On disconnect the token is revoked, every slot of the connection is
//!    torn down and its desktop tunnel is closed. Backend tmux sessions stay.
//!
//! ## Message types (client → server)
//!
//! | Event             | Fields                                | Response                          |
//! |-------------------|---------------------------------------|-----------------------------------|
//! | `handshake`       | `api_key`                             | `connected` or `error` + close    |
//! | `get_sessions`    | `csrf_token`                          | `sessions_list`                   |
//! | `create_session`  | `csrf_token`, `type`, `name?`         | `session_created`                 |
//! | `attach_session`  | `csrf_token`, `session`, `terminal`   | stream of `output`                |
//! | `input`           | `csrf_token`, `terminal`, `data`      | (none, `error` on dead slot)      |
//! | `resize`          | `csrf_token`, `terminal`, `rows`, `cols` | (none)                         |
//! | `close_session`   | `csrf_token`, `session`               | broadcast `session_closed`        |
//! | `restart_desktop` | `csrf_token`                          | `desktop_restarted` / `desktop_restart_error` |
//! | `tunnel_open`     | `csrf_token`, `path`                  | `tunnel_opened`, then `tunnel_data` |
//! | `tunnel_send`     | `data`, `binary?`                     | (none, `error` without a tunnel)  |
//!
//! A tunnel opens in the background because the desktop may need to start
//! first. `tunnel_send` frames that arrive meanwhile are queued and relayed,
//! in order, right before `tunnel_opened` is sent.

pub mod protocol;

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tracing::{debug, error, info, warn};

use crate::auth::{constant_time_eq, ConnectionId};
use crate::desktop::BackendSocket;
use crate::error::GatewayError;
use crate::terminal::SlotKey;
use crate::AppState;
use protocol::{ClientMessage, ServerMessage};

/// How long queued messages get to reach the client after the loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `tunnel_send` frames held while a tunnel is opening.
const MAX_QUEUED_TUNNEL_FRAMES: usize = 256;

/// `GET /ws` — WebSocket upgrade handler. Authentication happens in-band.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

enum Flow {
    Continue,
    Close,
}

/// Per-connection state owned by the control loop.
struct Connection {
    id: ConnectionId,
    authenticated: bool,
    tx: mpsc::Sender<ServerMessage>,
    /// Desktop restarts, aborted on disconnect.
    tasks: Vec<JoinHandle<()>>,
    /// Tunnel being opened; registered by the control loop once connected.
    opening: Option<PendingTunnel>,
}

struct PendingTunnel {
    path: String,
    task: JoinHandle<Result<BackendSocket, GatewayError>>,
    queued: Vec<BackendMessage>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg).await;
    }

    async fn fail(&self, err: GatewayError) {
        debug!("Connection {}: {err}", self.id);
        self.send(ServerMessage::from(&err)).await;
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.server.outbound_queue.max(1));
    let mut broadcast_rx = state.session_events.subscribe();
    let mut conn = Connection {
        id: ConnectionId::new(),
        authenticated: false,
        tx,
        tasks: Vec::new(),
        opening: None,
    };
    info!("Connection {} opened", conn.id);

    // Task: forward queued messages to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let flow = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(message) => dispatch(&state, &mut conn, message).await,
                    Err(e) => {
                        conn.fail(GatewayError::InvalidMessage(e.to_string())).await;
                        Flow::Continue
                    }
                };
                if matches!(flow, Flow::Close) {
                    break;
                }
            }
            opened = tunnel_opened(&mut conn.opening) => {
                finish_tunnel_open(&state, &mut conn, opened).await;
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        if conn.authenticated {
                            conn.send(event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection {}: missed {n} broadcast event(s)", conn.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    for task in conn.tasks.drain(..) {
        task.abort();
        let _ = task.await;
    }
    if let Some(pending) = conn.opening.take() {
        pending.task.abort();
        // A socket that connected anyway is dropped here, never registered.
        let _ = pending.task.await;
    }
    state.csrf.revoke(conn.id).await;
    state.terminals.cleanup_connection(conn.id).await;
    state.tunnels.close(conn.id).await;

    let id = conn.id;
    drop(conn);
    let abort = send_task.abort_handle();
    if tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        abort.abort();
    }
    info!("Connection {id} closed");
}

async fn dispatch(state: &AppState, conn: &mut Connection, message: ClientMessage) -> Flow {
    if !conn.authenticated && !matches!(message, ClientMessage::Handshake { .. }) {
        conn.fail(GatewayError::NotAuthenticated).await;
        return Flow::Continue;
    }
    if let Some(token) = message.csrf_token() {
        if !state.csrf.validate(conn.id, token).await {
            warn!("Connection {}: {} rejected, bad CSRF token", conn.id, message.event());
            conn.fail(GatewayError::CsrfRejected).await;
            return Flow::Continue;
        }
    }

    match message {
        ClientMessage::Handshake { api_key } => return handshake(state, conn, &api_key).await,
        ClientMessage::GetSessions { .. } => {
            let sessions = state.terminals.list_sessions().await;
            conn.send(ServerMessage::SessionsList { sessions }).await;
        }
        ClientMessage::CreateSession { kind, name, .. } => {
            match state.terminals.create_session(kind, name.as_deref()).await {
                Ok(name) => conn.send(ServerMessage::SessionCreated { name }).await,
                Err(e) => conn.fail(e).await,
            }
        }
        ClientMessage::AttachSession {
            session, terminal, ..
        } => {
            let key = SlotKey::new(conn.id, terminal);
            if let Err(e) = state.terminals.attach(&session, key, conn.tx.clone()).await {
                conn.fail(e).await;
            }
        }
        ClientMessage::Input { terminal, data, .. } => {
            let key = SlotKey::new(conn.id, terminal);
            if !state.terminals.write(key, data.as_bytes()).await {
                conn.fail(GatewayError::SlotNotFound(terminal)).await;
            }
        }
        ClientMessage::Resize {
            terminal,
            rows,
            cols,
            ..
        } => {
            let key = SlotKey::new(conn.id, terminal);
            if !state.terminals.resize(key, rows, cols).await {
                debug!("Connection {}: resize of detached terminal {terminal}", conn.id);
            }
        }
        ClientMessage::CloseSession { session, .. } => match state.terminals.kill(&session).await {
            Ok(()) => {
                let _ = state
                    .session_events
                    .send(ServerMessage::SessionClosed { session });
            }
            Err(e) => conn.fail(e).await,
        },
        ClientMessage::RestartDesktop { .. } => {
            let desktop = state.desktop.clone();
            let tx = conn.tx.clone();
            conn.spawn(async move {
                let msg = match desktop.restart().await {
                    Ok(()) => ServerMessage::DesktopRestarted,
                    Err(e) => ServerMessage::DesktopRestartError {
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(msg).await;
            });
        }
        ClientMessage::TunnelOpen { path, .. } => {
            let mut queued = Vec::new();
            if let Some(previous) = conn.opening.take() {
                previous.task.abort();
                let _ = previous.task.await;
                queued = previous.queued;
            }
            let desktop = state.desktop.clone();
            let target = path.clone();
            let task = tokio::spawn(async move {
                if !desktop.ready_for_forwarding().await {
                    return Err(GatewayError::BackendUnavailable(
                        "desktop is starting".to_string(),
                    ));
                }
                desktop.open_tunnel(&target).await
            });
            conn.opening = Some(PendingTunnel { path, task, queued });
        }
        ClientMessage::TunnelSend { data, binary } => {
            let frame = if binary {
                match base64::engine::general_purpose::STANDARD.decode(&data) {
                    Ok(bytes) => BackendMessage::binary(bytes),
                    Err(e) => {
                        conn.fail(GatewayError::InvalidMessage(format!("bad base64: {e}")))
                            .await;
                        return Flow::Continue;
                    }
                }
            } else {
                BackendMessage::text(data)
            };
            if let Some(pending) = &mut conn.opening {
                if pending.queued.len() < MAX_QUEUED_TUNNEL_FRAMES {
                    pending.queued.push(frame);
                    return Flow::Continue;
                }
            }
            if conn.opening.is_some() {
                conn.fail(GatewayError::BackendUnavailable(
                    "tunnel is still opening and its send queue is full".to_string(),
                ))
                .await;
                return Flow::Continue;
            }
            if !state.tunnels.send(conn.id, frame).await {
                conn.fail(GatewayError::NoTunnel).await;
            }
        }
    }
    Flow::Continue
}

async fn handshake(state: &AppState, conn: &mut Connection, api_key: &str) -> Flow {
    let accepted = state
        .secrets
        .api_key()
        .await
        .is_some_and(|expected| constant_time_eq(expected.as_bytes(), api_key.as_bytes()));
    if !accepted {
        warn!("Connection {}: handshake rejected", conn.id);
        conn.fail(GatewayError::AuthenticationRejected).await;
        return if conn.authenticated {
            Flow::Continue
        } else {
            Flow::Close
        };
    }

    let csrf_token = state.csrf.issue(conn.id).await;
    if !conn.authenticated {
        conn.authenticated = true;
        info!("Connection {} authenticated", conn.id);
    }
    conn.send(ServerMessage::Connected { csrf_token }).await;
    Flow::Continue
}

/// Resolves when the pending tunnel open finishes; never, if none is pending.
async fn tunnel_opened(
    opening: &mut Option<PendingTunnel>,
) -> Result<Result<BackendSocket, GatewayError>, JoinError> {
    match opening {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

/// Register a freshly connected tunnel, relay what was queued for it and
/// acknowledge it.
async fn finish_tunnel_open(
    state: &AppState,
    conn: &mut Connection,
    opened: Result<Result<BackendSocket, GatewayError>, JoinError>,
) {
    let Some(pending) = conn.opening.take() else {
        return;
    };
    match opened {
        Ok(Ok(socket)) => {
            state.tunnels.open(conn.id, socket, conn.tx.clone()).await;
            for frame in pending.queued {
                state.tunnels.send(conn.id, frame).await;
            }
            conn.send(ServerMessage::TunnelOpened { path: pending.path })
                .await;
        }
        Ok(Err(e)) => {
            warn!(
                "Connection {}: tunnel to {} failed, {} queued frame(s) dropped: {e}",
                conn.id,
                pending.path,
                pending.queued.len()
            );
            conn.send(ServerMessage::from(&e)).await;
        }
        Err(e) => debug!("Connection {}: tunnel open ended: {e}", conn.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    struct Client {
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl Client {
        async fn connect(state: &AppState) -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = crate::routes::router(state.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            Self::connect_to(&format!("ws://{addr}/ws")).await
        }

        async fn connect_to(url: &str) -> Self {
            let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            Self { socket }
        }

        async fn send(&mut self, event: &str, data: Value) {
            let frame = json!({"event": event, "data": data}).to_string();
            self.socket.send(BackendMessage::text(frame)).await.unwrap();
        }

        /// Next JSON frame, or `None` once the server closed the socket.
        async fn recv(&mut self) -> Option<Value> {
            loop {
                let next = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                    .await
                    .expect("timed out waiting for a frame");
                match next {
                    Some(Ok(BackendMessage::Text(t))) => {
                        return Some(serde_json::from_str(t.as_str()).unwrap())
                    }
                    Some(Ok(BackendMessage::Close(_))) | None | Some(Err(_)) => return None,
                    Some(Ok(_)) => {}
                }
            }
        }

        /// Skip frames until one with `event` arrives.
        async fn expect(&mut self, event: &str) -> Value {
            loop {
                let frame = self.recv().await.expect("socket closed");
                if frame["event"] == event {
                    return frame["data"].clone();
                }
            }
        }

        async fn handshake(&mut self) -> String {
            self.send("handshake", json!({"api_key": "test-key"})).await;
            let data = self.expect("connected").await;
            data["csrf_token"].as_str().unwrap().to_string()
        }
    }

    async fn wait_until<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_bad_key_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        client.send("handshake", json!({"api_key": "wrong"})).await;
        let frame = client.recv().await.unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["code"], "AUTHENTICATION_REJECTED");
        assert!(client.recv().await.is_none());
        assert!(state.csrf.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_key_file_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        std::fs::remove_file(dir.path().join("api_key")).unwrap();
        let mut client = Client::connect(&state).await;
        client.send("handshake", json!({"api_key": "test-key"})).await;
        assert_eq!(client.expect("error").await["code"], "AUTHENTICATION_REJECTED");
    }

    #[tokio::test]
    async fn test_commands_before_handshake_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        client.send("get_sessions", json!({"csrf_token": "x"})).await;
        assert_eq!(client.expect("error").await["code"], "NOT_AUTHENTICATED");
        // Still open: a later handshake works.
        let token = client.handshake().await;
        assert_eq!(token.len(), 43);
    }

    #[tokio::test]
    async fn test_bad_token_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;

        client
            .send("create_session", json!({"csrf_token": "forged", "type": "plain"}))
            .await;
        assert_eq!(client.expect("error").await["code"], "CSRF_REJECTED");
        client.send("create_session", json!({"type": "plain"})).await;
        assert_eq!(client.expect("error").await["code"], "CSRF_REJECTED");
        assert!(state.terminals.list_sessions().await.is_empty());

        // Re-handshake hands back the same token.
        assert_eq!(client.handshake().await, token);
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        client
            .socket
            .send(BackendMessage::text("not json"))
            .await
            .unwrap();
        assert_eq!(client.expect("error").await["code"], "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_terminal_flow_and_broadcast_close() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;
        let mut observer = Client::connect(&state).await;
        observer.handshake().await;

        client
            .send("create_session", json!({"csrf_token": token, "type": "plain"}))
            .await;
        assert_eq!(client.expect("session_created").await["name"], "Shell");

        client.send("get_sessions", json!({"csrf_token": token})).await;
        assert_eq!(client.expect("sessions_list").await["sessions"], json!(["Shell"]));

        client
            .send(
                "attach_session",
                json!({"csrf_token": token, "session": "Shell", "terminal": 2}),
            )
            .await;
        client
            .send(
                "resize",
                json!({"csrf_token": token, "terminal": 2, "rows": 30, "cols": 100}),
            )
            .await;
        client
            .send(
                "input",
                json!({"csrf_token": token, "terminal": 2, "data": "over-the-wire\n"}),
            )
            .await;
        let mut seen = String::new();
        while !seen.contains("got:over-the-wire") {
            let data = client.expect("output").await;
            assert_eq!(data["terminal"], 2);
            seen.push_str(data["data"].as_str().unwrap());
        }

        client
            .send(
                "input",
                json!({"csrf_token": token, "terminal": 9, "data": "x"}),
            )
            .await;
        assert_eq!(client.expect("error").await["code"], "SLOT_NOT_FOUND");

        client
            .send("close_session", json!({"csrf_token": token, "session": "Shell"}))
            .await;
        assert_eq!(client.expect("session_closed").await["session"], "Shell");
        assert_eq!(observer.expect("session_closed").await["session"], "Shell");
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .terminals
            .create_session(crate::terminal::SessionKind::Plain, None)
            .await
            .unwrap();

        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;
        for terminal in [1, 2] {
            client
                .send(
                    "attach_session",
                    json!({"csrf_token": token, "session": "Shell", "terminal": terminal}),
                )
                .await;
        }
        let terminals = state.terminals.clone();
        assert!(wait_until(|| {
            let t = terminals.clone();
            async move { t.slot_count().await == 2 }
        })
        .await);

        drop(client);
        let terminals = state.terminals.clone();
        assert!(wait_until(|| {
            let t = terminals.clone();
            async move { t.slot_count().await == 0 }
        })
        .await);
        let csrf = state.csrf.clone();
        assert!(wait_until(|| {
            let c = csrf.clone();
            async move { c.is_empty().await }
        })
        .await);
        // The backend session itself survives.
        assert_eq!(state.terminals.list_sessions().await, vec!["Shell"]);
    }

    #[tokio::test]
    async fn test_tunnel_send_without_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        client.handshake().await;
        client.send("tunnel_send", json!({"data": "hi"})).await;
        assert_eq!(client.expect("error").await["code"], "NO_TUNNEL");
    }

    #[tokio::test]
    async fn test_tunnel_open_to_unavailable_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;
        client
            .send("tunnel_open", json!({"csrf_token": token, "path": "websockify"}))
            .await;
        assert_eq!(client.expect("error").await["code"], "BACKEND_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_tunnel_round_trip_with_early_send() {
        let dir = tempfile::tempdir().unwrap();
        let backend = crate::desktop::tunnel::tests::spawn_ws_backend().await;
        let state = crate::state::tests::test_state_with_desktop(dir.path(), &backend);
        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;

        client
            .send("tunnel_open", json!({"csrf_token": token, "path": "websockify"}))
            .await;
        // Sent before the open is acknowledged: must be queued, not refused.
        client.send("tunnel_send", json!({"data": "early"})).await;

        let mut opened = false;
        let mut echoed = None;
        while !opened || echoed.is_none() {
            let frame = client.recv().await.expect("socket closed");
            match frame["event"].as_str() {
                Some("tunnel_opened") => {
                    assert_eq!(frame["data"]["path"], "websockify");
                    opened = true;
                }
                Some("tunnel_data") => echoed = Some(frame["data"].clone()),
                _ => panic!("unexpected frame {frame}"),
            }
        }
        assert_eq!(echoed.unwrap(), json!({"data": "echo:early", "binary": false}));

        client
            .send("tunnel_send", json!({"data": "AQID", "binary": true}))
            .await;
        assert_eq!(
            client.expect("tunnel_data").await,
            json!({"data": "AQID", "binary": true})
        );
        assert!(!state.tunnels.is_empty().await);

        drop(client);
        let tunnels = state.tunnels.clone();
        assert!(wait_until(|| {
            let t = tunnels.clone();
            async move { t.is_empty().await }
        })
        .await);
    }

    #[tokio::test]
    async fn test_disconnect_with_stalled_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .terminals
            .create_session(crate::terminal::SessionKind::Plain, None)
            .await
            .unwrap();
        std::fs::write(dir.path().join("stall-attach"), "").unwrap();

        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;
        client
            .send(
                "attach_session",
                json!({"csrf_token": token, "session": "Shell", "terminal": 1}),
            )
            .await;
        let terminals = state.terminals.clone();
        assert!(wait_until(|| {
            let t = terminals.clone();
            async move { t.slot_count().await == 1 }
        })
        .await);

        let flood = "x".repeat(1 << 20);
        for _ in 0..4 {
            client
                .send("input", json!({"csrf_token": token, "terminal": 1, "data": flood}))
                .await;
        }
        // The control loop must still answer while the terminal is stuck.
        client.send("get_sessions", json!({"csrf_token": token})).await;
        client.expect("sessions_list").await;

        drop(client);
        let terminals = state.terminals.clone();
        assert!(wait_until(|| {
            let t = terminals.clone();
            async move { t.slot_count().await == 0 }
        })
        .await);
        assert!(state.csrf.is_empty().await);
    }

    #[tokio::test]
    async fn test_restart_desktop_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut client = Client::connect(&state).await;
        let token = client.handshake().await;
        client
            .send("restart_desktop", json!({"csrf_token": token}))
            .await;
        let data = client.expect("desktop_restart_error").await;
        assert!(data["error"].as_str().unwrap().contains("docker restart"));
    }
}
