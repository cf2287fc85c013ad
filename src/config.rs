//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TERMGATE_LISTEN`, `TERMGATE_API_KEY_FILE`,
//!    `TERMGATE_DESKTOP_URL`
//! 2. **Config file** — path via `--config <path>`, or `termgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5000"
//! allowed_origins = ["http://localhost:8080"]
//! poll_tick_ms = 100
//! read_chunk_size = 10240
//!
//! [secrets]
//! api_key_file = "/etc/termgate/api_key"
//! desktop_credential_file = "/etc/termgate/desktop_password"
//!
//! [tmux]
//! command = ["tmux"]
//! history_lines = 32768
//! agent_command = "kiro-cli chat"
//! unchained_command = "kiro-cli chat --trust-all-tools"
//!
//! [desktop]
//! url = "https://localhost:6901"
//! user = "kasm_user"
//! mount_path = "/proxy"
//! container = "fernando-desktop"
//! compose_dir = "/home/coder/fernando"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Secrets never live in this file: only the paths to them do. The files are
//! re-read on every use so they can be rotated without a restart.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub desktop: DesktopConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and stream-pump settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:5000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Origins allowed by the CORS layer. Empty allows none.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Readability poll tick for terminal pumps in milliseconds (default 100).
    /// Bounds how long a cancelled pump may linger.
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,
    /// Maximum bytes read from a PTY master per tick (default 10 KB).
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Default terminal rows for freshly attached slots (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns for freshly attached slots (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
    /// Maximum in-flight `/proxy` requests (default 64).
    #[serde(default = "default_max_proxy_requests")]
    pub max_proxy_requests: usize,
    /// Capacity of each connection's outbound message queue (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Locations of the two process-external secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// File holding the client API key. Override with `TERMGATE_API_KEY_FILE`.
    #[serde(default = "default_api_key_file")]
    pub api_key_file: String,
    /// File holding the desktop backend's Basic-auth password.
    #[serde(default = "default_desktop_credential_file")]
    pub desktop_credential_file: String,
}

/// Backend terminal multiplexer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TmuxConfig {
    /// Program plus leading arguments used for every tmux invocation, e.g.
    /// `["tmux", "-L", "termgate"]` to use a dedicated server socket.
    #[serde(default = "default_tmux_command")]
    pub command: Vec<String>,
    /// Scrollback lines captured by `/history` and kept by new sessions.
    #[serde(default = "default_history_lines")]
    pub history_lines: u32,
    /// Canonical name for `plain` sessions.
    #[serde(default = "default_shell_name")]
    pub shell_name: String,
    /// Canonical name for `agent` sessions.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Canonical name for `agent-unchained` sessions.
    #[serde(default = "default_unchained_name")]
    pub unchained_name: String,
    /// Startup command typed into `agent` sessions.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// Startup command typed into `agent-unchained` sessions.
    #[serde(default = "default_unchained_command")]
    pub unchained_command: String,
    /// How long a detaching controller gets after SIGTERM before SIGKILL.
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,
}

/// Remote desktop backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DesktopConfig {
    /// Base URL of the desktop service. Override with `TERMGATE_DESKTOP_URL`.
    #[serde(default = "default_desktop_url")]
    pub url: String,
    /// Basic-auth user; the password comes from the secret store.
    #[serde(default = "default_desktop_user")]
    pub user: String,
    /// Path polled by `ensure_ready`.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    /// URL prefix the proxied application is served under.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    /// Container name looked up with `docker ps` and restarted by `restart`.
    #[serde(default = "default_container")]
    pub container: String,
    /// Compose service started when the container is not running.
    #[serde(default = "default_container")]
    pub compose_service: String,
    /// Working directory for the compose invocation.
    #[serde(default = "default_compose_dir")]
    pub compose_dir: String,
    /// Program plus leading arguments for docker.
    #[serde(default = "default_docker_command")]
    pub docker_command: Vec<String>,
    /// Program plus leading arguments for compose.
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,
    /// Readiness poll budget (default 60 attempts).
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    /// Delay between readiness polls in milliseconds (default 1000).
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
    /// Pause after `docker restart` before polling (default 2000 ms).
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
    /// Per-request timeout for proxied HTTP calls in seconds (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Skip TLS certificate validation (the desktop sits on a private network
    /// with a self-signed certificate). Default true.
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8080".to_string()]
}
fn default_poll_tick_ms() -> u64 {
    100
}
fn default_read_chunk_size() -> usize {
    10 * 1024
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_max_proxy_requests() -> usize {
    64
}
fn default_outbound_queue() -> usize {
    256
}
fn default_api_key_file() -> String {
    "/etc/termgate/api_key".to_string()
}
fn default_desktop_credential_file() -> String {
    "/etc/termgate/desktop_password".to_string()
}
fn default_tmux_command() -> Vec<String> {
    vec!["tmux".to_string()]
}
fn default_history_lines() -> u32 {
    32768
}
fn default_shell_name() -> String {
    "Shell".to_string()
}
fn default_agent_name() -> String {
    "Agent".to_string()
}
fn default_unchained_name() -> String {
    "Agent-Unchained".to_string()
}
fn default_agent_command() -> String {
    "kiro-cli chat".to_string()
}
fn default_unchained_command() -> String {
    "kiro-cli chat --trust-all-tools".to_string()
}
fn default_cleanup_timeout_ms() -> u64 {
    2000
}
fn default_desktop_url() -> String {
    "https://localhost:6901".to_string()
}
fn default_desktop_user() -> String {
    "kasm_user".to_string()
}
fn default_status_path() -> String {
    "/".to_string()
}
fn default_mount_path() -> String {
    "/proxy".to_string()
}
fn default_container() -> String {
    "fernando-desktop".to_string()
}
fn default_compose_dir() -> String {
    "/home/coder/fernando".to_string()
}
fn default_docker_command() -> Vec<String> {
    vec!["docker".to_string()]
}
fn default_compose_command() -> Vec<String> {
    vec!["docker-compose".to_string()]
}
fn default_ready_attempts() -> u32 {
    60
}
fn default_ready_interval_ms() -> u64 {
    1000
}
fn default_restart_grace_ms() -> u64 {
    2000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_accept_invalid_certs() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            allowed_origins: default_allowed_origins(),
            poll_tick_ms: default_poll_tick_ms(),
            read_chunk_size: default_read_chunk_size(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
            max_proxy_requests: default_max_proxy_requests(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            api_key_file: default_api_key_file(),
            desktop_credential_file: default_desktop_credential_file(),
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            command: default_tmux_command(),
            history_lines: default_history_lines(),
            shell_name: default_shell_name(),
            agent_name: default_agent_name(),
            unchained_name: default_unchained_name(),
            agent_command: default_agent_command(),
            unchained_command: default_unchained_command(),
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
        }
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            url: default_desktop_url(),
            user: default_desktop_user(),
            status_path: default_status_path(),
            mount_path: default_mount_path(),
            container: default_container(),
            compose_service: default_container(),
            compose_dir: default_compose_dir(),
            docker_command: default_docker_command(),
            compose_command: default_compose_command(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
            restart_grace_ms: default_restart_grace_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            accept_invalid_certs: default_accept_invalid_certs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms.max(1))
    }
}

impl TmuxConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

impl DesktopConfig {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    /// Mount path without a trailing slash (`/proxy/` and `/proxy` are the same mount).
    pub fn mount(&self) -> &str {
        let trimmed = self.mount_path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/proxy"
        } else {
            trimmed
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `termgate.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("termgate.toml").exists() {
            let content =
                std::fs::read_to_string("termgate.toml").expect("Failed to read termgate.toml");
            Self::parse(&content).expect("Failed to parse termgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("TERMGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(path) = std::env::var("TERMGATE_API_KEY_FILE") {
            config.secrets.api_key_file = path;
        }
        if let Ok(url) = std::env::var("TERMGATE_DESKTOP_URL") {
            config.desktop.url = url;
        }

        config
    }

    /// Parse a TOML document. Empty command vectors are rejected here so the
    /// process layer never has to handle a missing program name.
    pub fn parse(content: &str) -> Result<Self, String> {
        let config: Config = toml::from_str(content).map_err(|e| e.to_string())?;
        if config.tmux.command.is_empty() {
            return Err("tmux.command must name a program".to_string());
        }
        if config.desktop.docker_command.is_empty() || config.desktop.compose_command.is_empty() {
            return Err("desktop.docker_command and desktop.compose_command must name a program".to_string());
        }
        validate_mount_path(&config.desktop.mount_path)?;
        Ok(config)
    }
}

/// The mount becomes a route prefix, so it must be an absolute path without
/// route or URL syntax in it.
fn validate_mount_path(mount: &str) -> Result<(), String> {
    if !mount.starts_with('/') {
        return Err(format!("desktop.mount_path must start with '/': {mount:?}"));
    }
    if mount.contains(['{', '}', '*', '?', '#']) || mount.contains("//") {
        return Err(format!("desktop.mount_path is not a plain path: {mount:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.poll_tick_ms, 100);
        assert_eq!(config.server.read_chunk_size, 10240);
        assert_eq!(config.tmux.history_lines, 32768);
        assert_eq!(config.tmux.command, vec!["tmux".to_string()]);
        assert_eq!(config.desktop.ready_attempts, 60);
        assert_eq!(config.desktop.mount(), "/proxy");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [tmux]
            command = ["tmux", "-L", "gate"]
            shell_name = "Term"

            [desktop]
            mount_path = "/desk/"
            "#,
        )
        .unwrap();
        assert_eq!(config.tmux.command.len(), 3);
        assert_eq!(config.tmux.shell_name, "Term");
        assert_eq!(config.tmux.agent_name, "Agent");
        assert_eq!(config.desktop.mount(), "/desk");
        assert_eq!(config.desktop.user, "kasm_user");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(Config::parse("[tmux]\ncommand = []").is_err());
        assert!(Config::parse("[desktop]\ndocker_command = []").is_err());
    }

    #[test]
    fn test_mount_path_must_be_a_plain_absolute_path() {
        for bad in ["desk", "", "/desk/{id}", "/desk/*", "//desk"] {
            let doc = format!("[desktop]\nmount_path = {bad:?}");
            assert!(Config::parse(&doc).is_err(), "{bad:?} should be rejected");
        }
        let config = Config::parse("[desktop]\nmount_path = \"/remote-desk\"").unwrap();
        assert_eq!(config.desktop.mount(), "/remote-desk");
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(Config::parse("[server]\npoll_tick_ms = \"fast\"").is_err());
    }
}
