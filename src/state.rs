//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::auth::CsrfTokens;
use crate::config::Config;
use crate::desktop::tunnel::TunnelRegistry;
use crate::desktop::DesktopProxy;
use crate::error::GatewayError;
use crate::secrets::SecretStore;
use crate::terminal::TerminalManager;
use crate::ws::protocol::ServerMessage;

/// Capacity of the gateway-wide event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Reads the API key and desktop credential from disk on demand.
    pub secrets: SecretStore,
    /// One CSRF token per authenticated WebSocket connection.
    pub csrf: CsrfTokens,
    /// Backend tmux sessions and the slots attached to them.
    pub terminals: TerminalManager,
    /// Desktop container lifecycle and HTTP proxy.
    pub desktop: DesktopProxy,
    /// At most one desktop tunnel per connection.
    pub tunnels: TunnelRegistry,
    /// Events every authenticated connection receives (`session_closed`).
    pub session_events: broadcast::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let secrets = SecretStore::new(&config.secrets);
        let terminals = TerminalManager::new(&config.tmux, &config.server);
        let desktop = DesktopProxy::new(&config.desktop, secrets.clone())?;
        let (session_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            secrets,
            csrf: CsrfTokens::new(),
            terminals,
            desktop,
            tunnels: TunnelRegistry::new(),
            session_events,
        })
    }

    /// Release every slot and tunnel. Called once on shutdown.
    pub async fn shutdown(&self) {
        self.terminals.cleanup_all().await;
        self.tunnels.close_all().await;
    }
}
