//! Per-connection desktop tunnels.
//!
//! Each connection holds at most one relayed WebSocket to the desktop's
//! control endpoint. Opening a new one closes the old one. The receive half
//! runs in a pump worker; the send half sits behind a mutex so client
//! messages can be written from the control loop.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::BackendSocket;
use crate::auth::ConnectionId;
use crate::pump;
use crate::ws::protocol::ServerMessage;

type BackendSink = SplitSink<BackendSocket, Message>;

struct DesktopTunnel {
    /// Distinguishes this tunnel from a later replacement for the same
    /// connection, so a finishing worker only removes its own entry.
    id: Uuid,
    sink: Arc<Mutex<BackendSink>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl DesktopTunnel {
    async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Tunnel close: {e}");
        }
        let _ = self.worker.await;
    }
}

/// Cloneable: all clones share the same table.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<ConnectionId, DesktopTunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `socket` as the tunnel of `conn` and start relaying
    /// backend frames into `output`. Replaces any previous tunnel.
    pub async fn open(
        &self,
        conn: ConnectionId,
        socket: BackendSocket,
        output: mpsc::Sender<ServerMessage>,
    ) {
        let (sink, stream) = socket.split();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let registry = self.clone();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            pump::run_tunnel_pump(stream, output, worker_cancel).await;
            registry.forget(conn, id).await;
        });

        let tunnel = DesktopTunnel {
            id,
            sink: Arc::new(Mutex::new(sink)),
            cancel,
            worker,
        };
        let previous = self.tunnels.lock().await.insert(conn, tunnel);
        if let Some(previous) = previous {
            info!("Connection {conn}: replacing desktop tunnel");
            previous.close().await;
        }
    }

    /// Relay one client frame to the backend. Returns `false` if `conn` has
    /// no tunnel; send errors are logged and otherwise ignored.
    pub async fn send(&self, conn: ConnectionId, message: Message) -> bool {
        let sink = {
            let tunnels = self.tunnels.lock().await;
            tunnels.get(&conn).map(|t| Arc::clone(&t.sink))
        };
        let Some(sink) = sink else {
            return false;
        };
        if let Err(e) = sink.lock().await.send(message).await {
            debug!("Connection {conn}: tunnel send failed: {e}");
        }
        true
    }

    /// Close the tunnel of `conn`, if any.
    pub async fn close(&self, conn: ConnectionId) {
        let tunnel = self.tunnels.lock().await.remove(&conn);
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
            info!("Connection {conn}: desktop tunnel closed");
        }
    }

    /// Close every tunnel (server shutdown).
    pub async fn close_all(&self) {
        let all: Vec<DesktopTunnel> = self.tunnels.lock().await.drain().map(|(_, t)| t).collect();
        futures::future::join_all(all.into_iter().map(DesktopTunnel::close)).await;
    }

    pub async fn contains(&self, conn: ConnectionId) -> bool {
        self.tunnels.lock().await.contains_key(&conn)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop the entry for `conn` if it is still tunnel `id`.
    async fn forget(&self, conn: ConnectionId, id: Uuid) {
        let mut tunnels = self.tunnels.lock().await;
        if tunnels.get(&conn).is_some_and(|t| t.id == id) {
            tunnels.remove(&conn);
            debug!("Connection {conn}: desktop tunnel ended");
        }
    }
}
