#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! termgate library: the session gateway behind the `termgate` binary.
//!
//! - `terminal` — tmux-backed sessions and the PTY slots attached to them
//! - `pump` — per-slot and per-tunnel output workers
//! - `desktop` — desktop container lifecycle, HTTP proxy, WebSocket tunnels
//! - `auth` — API key middleware and per-connection CSRF tokens
//! - `secrets` — on-demand reads of the key and credential files
//! - `config` — configuration loading
//! - `routes` — HTTP handlers and router assembly
//! - `ws` — WebSocket protocol handling

pub mod auth;
pub mod config;
pub mod desktop;
pub mod error;
pub mod pump;
pub mod routes;
pub mod secrets;
pub mod state;
pub mod terminal;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use desktop::DesktopProxy;
pub use error::GatewayError;
pub use state::AppState;
pub use terminal::TerminalManager;
