//! Terminal session management.
//!
//! [`TerminalManager`] is the single authority over the slot table. A slot is
//! one (connection, terminal number) pair with a PTY master, an attached tmux
//! client process and a pump worker. Backend sessions live in tmux and outlive
//! every connection; slots die with their connection.
//!
//! ## Concurrency
//!
//! The slot table sits behind one `Mutex` that is held only for the map
//! operation. I/O on a slot's master goes through a cloned `Arc` taken under
//! the lock, and teardown runs after the entry has been removed.

pub mod pty;
pub mod tmux;

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;
use tokio::io::unix::AsyncFd;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::ConnectionId;
use crate::config::{ServerConfig, TmuxConfig};
use crate::error::GatewayError;
use crate::pump::{self, PumpSettings};
use crate::ws::protocol::ServerMessage;
use pty::PtyPair;
use tmux::Tmux;

/// Highest suffix tried when looking for a free session name.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Input chunks a slot buffers while its controller is not reading.
const INPUT_QUEUE: usize = 64;

/// What a new backend session starts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    #[default]
    Plain,
    Agent,
    AgentUnchained,
}

/// Identity of one terminal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub connection: ConnectionId,
    pub terminal: u32,
}

impl SlotKey {
    pub fn new(connection: ConnectionId, terminal: u32) -> Self {
        Self {
            connection,
            terminal,
        }
    }
}

/// A live slot: everything that has to be released when it goes away.
struct TerminalSlot {
    session: String,
    master: Arc<AsyncFd<File>>,
    controller: Child,
    pid: Option<u32>,
    input: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TerminalSlot {
    /// Stop the worker, close the master, then terminate the controller:
    /// SIGTERM first, SIGKILL if it is still around after `grace`.
    async fn shutdown(self, key: SlotKey, grace: Duration) {
        let TerminalSlot {
            session,
            master,
            mut controller,
            pid,
            input,
            cancel,
            worker,
            writer,
        } = self;

        cancel.cancel();
        drop(input);
        for task in [worker, writer] {
            if let Err(e) = task.await {
                debug!("Slot {}:{} task ended abnormally: {e}", key.connection, key.terminal);
            }
        }
        // The reader and writer held the only other references, so this
        // closes the fd.
        drop(master);

        if let Some(pid) = pid {
            if let Err(e) = pty::signal_process(pid, Signal::SIGTERM) {
                debug!("SIGTERM to controller {pid} failed: {e}");
            }
        }
        if tokio::time::timeout(grace, controller.wait()).await.is_err() {
            warn!(
                "Controller for slot {}:{} ({session}) ignored SIGTERM, killing",
                key.connection, key.terminal
            );
            if let Err(e) = controller.kill().await {
                warn!("SIGKILL to controller failed: {e}");
            }
        }
    }
}

/// Manages backend sessions and the per-connection slots attached to them.
///
/// Cloneable: all clones share the same slot table.
#[derive(Clone)]
pub struct TerminalManager {
    slots: Arc<Mutex<HashMap<SlotKey, TerminalSlot>>>,
    tmux: Tmux,
    config: Arc<TmuxConfig>,
    pump: PumpSettings,
    rows: u16,
    cols: u16,
}

impl TerminalManager {
    pub fn new(tmux: &TmuxConfig, server: &ServerConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            tmux: Tmux::new(tmux),
            config: Arc::new(tmux.clone()),
            pump: PumpSettings {
                tick: server.poll_tick(),
                chunk_size: server.read_chunk_size,
            },
            rows: server.default_terminal_rows,
            cols: server.default_terminal_cols,
        }
    }

    /// Names of all backend sessions, empty when there are none or tmux
    /// cannot be queried.
    pub async fn list_sessions(&self) -> Vec<String> {
        self.tmux.list_sessions().await
    }

    /// Create a backend session and return its final (unique) name.
    pub async fn create_session(
        &self,
        kind: SessionKind,
        name: Option<&str>,
    ) -> Result<String, GatewayError> {
        let base = match name {
            Some(name) => {
                validate_session_name(name)?;
                name
            }
            None => match kind {
                SessionKind::Plain => self.config.shell_name.as_str(),
                SessionKind::Agent => self.config.agent_name.as_str(),
                SessionKind::AgentUnchained => self.config.unchained_name.as_str(),
            },
        };
        validate_session_name(base)?;

        let name = self.unique_name(base).await?;
        self.tmux
            .new_session(&name)
            .await
            .map_err(|reason| GatewayError::SessionCreateFailed {
                name: name.clone(),
                reason,
            })?;

        let startup = match kind {
            SessionKind::Plain => None,
            SessionKind::Agent => Some(&self.config.agent_command),
            SessionKind::AgentUnchained => Some(&self.config.unchained_command),
        };
        let configured = match self.tmux.apply_defaults(&name).await {
            Ok(()) => match startup.filter(|c| !c.is_empty()) {
                Some(command) => self
                    .tmux
                    .send_command(&name, command)
                    .await
                    .map_err(|e| format!("failed to start {command:?}: {e}")),
                None => Ok(()),
            },
            Err(e) => Err(format!("failed to set display options: {e}")),
        };
        if let Err(reason) = configured {
            // Do not leave a half-configured session holding the name.
            if let Err(e) = self.tmux.kill_session(&name).await {
                warn!("Session {name}: cleanup after failed create: {e}");
            }
            return Err(GatewayError::SessionCreateFailed { name, reason });
        }

        info!("Created session {name} ({kind:?})");
        Ok(name)
    }

    async fn unique_name(&self, base: &str) -> Result<String, GatewayError> {
        if !self.tmux.has_session(base).await {
            return Ok(base.to_string());
        }
        for n in 2..=MAX_NAME_SUFFIX {
            let candidate = format!("{base}-{n}");
            if !self.tmux.has_session(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(GatewayError::SessionCreateFailed {
            name: base.to_string(),
            reason: "no free name".to_string(),
        })
    }

    /// Attach `key` to an existing backend session and start its pump.
    ///
    /// Whatever occupied the slot is fully torn down first. Output is pushed
    /// into `output` as `output{terminal, data}` messages.
    pub async fn attach(
        &self,
        session: &str,
        key: SlotKey,
        output: mpsc::Sender<ServerMessage>,
    ) -> Result<(), GatewayError> {
        validate_session_name(session)?;
        if !self.tmux.has_session(session).await {
            return Err(GatewayError::SessionNotFound(session.to_string()));
        }

        self.cleanup(key).await;

        let pair = pty::allocate_pty(self.rows, self.cols)
            .map_err(|e| GatewayError::Pty(format!("openpty failed: {e}")))?;
        let (program, args) = self.tmux.attach_command(session);
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        let controller = pty::spawn_controller(&pair, &program, &args, &env)
            .map_err(|e| GatewayError::Pty(format!("failed to spawn {program}: {e}")))?;
        let pid = controller.id();

        let PtyPair { master, slave } = pair;
        drop(slave);
        let master = Arc::new(
            pty::into_async_master(master)
                .map_err(|e| GatewayError::Pty(format!("failed to register master: {e}")))?,
        );

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump::run_terminal_pump(
            key.terminal,
            Arc::clone(&master),
            output,
            cancel.clone(),
            self.pump,
        ));
        let (input, input_rx) = mpsc::channel(INPUT_QUEUE);
        let writer = tokio::spawn(pump::run_terminal_writer(
            key.terminal,
            Arc::clone(&master),
            input_rx,
            cancel.clone(),
        ));

        let slot = TerminalSlot {
            session: session.to_string(),
            master,
            controller,
            pid,
            input,
            cancel,
            worker,
            writer,
        };
        let previous = self.slots.lock().await.insert(key, slot);
        // Two attaches raced for the same slot; the later insert wins.
        if let Some(previous) = previous {
            previous.shutdown(key, self.config.cleanup_timeout()).await;
        }

        info!(
            "Slot {}:{} attached to {session} (pid {})",
            key.connection,
            key.terminal,
            pid.unwrap_or(0)
        );
        Ok(())
    }

    /// Queue raw bytes for a slot's PTY. Returns `false` if the slot is not
    /// live. Never waits on the PTY: when the controller has stopped reading
    /// and the slot's queue is full, the input is dropped.
    pub async fn write(&self, key: SlotKey, data: &[u8]) -> bool {
        let input = {
            let slots = self.slots.lock().await;
            slots.get(&key).map(|s| s.input.clone())
        };
        let Some(input) = input else {
            return false;
        };
        match input.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Slot {}:{} is not reading input, dropped {} byte(s)",
                    key.connection,
                    key.terminal,
                    data.len()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Resize a slot's PTY and notify the controller's process group.
    /// Returns `false` if the slot is not live; OS failures are only logged.
    pub async fn resize(&self, key: SlotKey, rows: u16, cols: u16) -> bool {
        let target = {
            let slots = self.slots.lock().await;
            slots.get(&key).map(|s| (Arc::clone(&s.master), s.pid))
        };
        let Some((master, pid)) = target else {
            return false;
        };
        if let Err(e) = pty::resize_pty(master.get_ref(), rows, cols) {
            warn!("Slot {}:{} resize failed: {e}", key.connection, key.terminal);
            return true;
        }
        if let Some(pid) = pid {
            if let Err(e) = pty::signal_group(pid, Signal::SIGWINCH) {
                debug!("SIGWINCH to group {pid} failed: {e}");
            }
        }
        true
    }

    /// Scrollback of a backend session without attaching to it.
    pub async fn capture(&self, session: &str) -> Result<String, GatewayError> {
        validate_session_name(session)?;
        if !self.tmux.has_session(session).await {
            return Err(GatewayError::SessionNotFound(session.to_string()));
        }
        self.tmux
            .capture(session)
            .await
            .map_err(|_| GatewayError::SessionNotFound(session.to_string()))
    }

    /// Destroy a backend session and release every slot attached to it,
    /// whichever connection owns them.
    pub async fn kill(&self, session: &str) -> Result<(), GatewayError> {
        validate_session_name(session)?;
        self.tmux.kill_session(session).await.map_err(|e| {
            debug!("kill-session {session}: {e}");
            GatewayError::SessionNotFound(session.to_string())
        })?;

        let attached: Vec<(SlotKey, TerminalSlot)> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<SlotKey> = slots
                .iter()
                .filter(|(_, s)| s.session == session)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| slots.remove(&k).map(|s| (k, s)))
                .collect()
        };
        let released = attached.len();
        let grace = self.config.cleanup_timeout();
        futures::future::join_all(
            attached
                .into_iter()
                .map(|(key, slot)| slot.shutdown(key, grace)),
        )
        .await;

        info!("Killed session {session} ({released} slot(s) released)");
        Ok(())
    }

    /// Tear down one slot. Idempotent; returns whether anything was attached.
    pub async fn cleanup(&self, key: SlotKey) -> bool {
        let slot = self.slots.lock().await.remove(&key);
        match slot {
            Some(slot) => {
                let session = slot.session.clone();
                slot.shutdown(key, self.config.cleanup_timeout()).await;
                info!("Slot {}:{} detached from {session}", key.connection, key.terminal);
                true
            }
            None => false,
        }
    }

    /// Tear down every slot owned by `connection`. Returns how many there were.
    pub async fn cleanup_connection(&self, connection: ConnectionId) -> usize {
        let owned: Vec<(SlotKey, TerminalSlot)> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<SlotKey> = slots
                .keys()
                .filter(|k| k.connection == connection)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| slots.remove(&k).map(|s| (k, s)))
                .collect()
        };
        let count = owned.len();
        let grace = self.config.cleanup_timeout();
        futures::future::join_all(owned.into_iter().map(|(key, slot)| slot.shutdown(key, grace)))
            .await;
        if count > 0 {
            info!("Connection {connection}: cleaned up {count} slot(s)");
        }
        count
    }

    /// Tear down every slot (server shutdown).
    pub async fn cleanup_all(&self) {
        let all: Vec<(SlotKey, TerminalSlot)> = self.slots.lock().await.drain().collect();
        let grace = self.config.cleanup_timeout();
        futures::future::join_all(all.into_iter().map(|(key, slot)| slot.shutdown(key, grace)))
            .await;
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_attached(&self, key: SlotKey) -> bool {
        self.slots.lock().await.contains_key(&key)
    }
}

/// Accept only `[A-Za-z0-9_-]+` so a name can never smuggle tmux target
/// syntax (`:`, `.`, `=`) or shell metacharacters.
pub fn validate_session_name(name: &str) -> Result<(), GatewayError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidSessionName(name.to_string()))
    }
}
