#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termgate
//!
//! Browser session gateway: several tmux-backed terminals and a proxied
//! remote desktop, all over one authenticated WebSocket per client.
//!
//! ## Subcommands
//!
//! - `termgate serve` (default) — run the HTTP/WS server
//! - `termgate history <session>` — print a session's scrollback and exit
//!
//! ## API surface
//!
//! | Method | Path                 | Auth | Description                         |
//! |--------|----------------------|------|-------------------------------------|
//! | GET    | `/api/health`        | No   | Liveness check                      |
//! | GET    | `/ws`                | Handshake | Terminal and tunnel multiplexing |
//! | GET    | `/`                  | Yes  | Backend session names               |
//! | GET    | `/history/{session}` | Yes  | Captured scrollback                 |
//! | *      | `/proxy/{*path}`     | Yes  | Desktop reverse proxy               |
//!
//! HTTP routes accept the key as `Authorization: Bearer <key>` or the
//! `termgate_key` cookie. The WebSocket authenticates with its first
//! `handshake` message instead.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! auth.rs          — Bearer/cookie middleware, constant-time compare, CSRF tokens
//! config.rs        — TOML + env-var configuration
//! secrets.rs       — key and credential files, re-read on every use
//! error.rs         — GatewayError with stable codes
//! pump.rs          — PTY and tunnel output workers
//! state.rs         — AppState shared by every handler
//! routes/
//!   health.rs      — GET /api/health
//!   sessions.rs    — GET /, GET /history/{session}
//!   proxy.rs       — /proxy/* forwarding
//! terminal/
//!   tmux.rs        — tmux command wrapper
//!   pty.rs         — PTY allocation, controller spawn, resize, signals
//!   mod.rs         — TerminalManager (sessions, slots, cleanup)
//! desktop/
//!   rewrite.rs     — root-relative path rewriting
//!   tunnel.rs      — per-connection WebSocket tunnels
//!   mod.rs         — DesktopProxy (readiness, restart, HTTP forwarding)
//! ws/
//!   protocol.rs    — client/server message types
//!   mod.rs         — WebSocket upgrade and dispatch
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use termgate::{routes, AppState, Config};

/// Browser session gateway for tmux terminals and a remote desktop.
#[derive(Parser)]
#[command(name = "termgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the captured scrollback of a backend session.
    History {
        /// Backend session name.
        session: String,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        Some(Commands::History { session, config }) => {
            print_history(&session, config.as_deref()).await;
        }
        None => run_server(None).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn print_history(session: &str, config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let terminals = termgate::TerminalManager::new(&config.tmux, &config.server);
    match terminals.capture(session).await {
        Ok(history) => print!("{history}"),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("termgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Desktop backend at {}", config.desktop.url);

    let state = AppState::new(config).expect("Failed to build application state");

    if state.secrets.api_key().await.is_none() {
        warn!(
            "API key file {} is missing or empty; every client will be rejected",
            state.config.secrets.api_key_file
        );
    }
    if state.secrets.desktop_credential().await.is_none() {
        warn!(
            "Desktop credential file {} is missing or empty; /proxy will fail",
            state.config.secrets.desktop_credential_file
        );
    }

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    state.shutdown().await;
    info!("Goodbye");
}
