//! Thin async wrapper over the tmux command line.
//!
//! Every call runs the configured program (plus its leading arguments, so a
//! dedicated `-L socket` can be baked in) as a short-lived child. Targets use
//! the `=name` exact-match form so `Shell` never resolves to `Shell-2`.

use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::config::TmuxConfig;

#[derive(Debug, Clone)]
pub struct Tmux {
    program: String,
    prefix: Vec<String>,
    history_lines: u32,
}

impl Tmux {
    pub fn new(config: &TmuxConfig) -> Self {
        let (program, prefix) = match config.command.split_first() {
            Some((program, prefix)) => (program.clone(), prefix.to_vec()),
            None => ("tmux".to_string(), Vec::new()),
        };
        Self {
            program,
            prefix,
            history_lines: config.history_lines,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, String> {
        debug!("tmux {}", args.join(" "));
        Command::new(&self.program)
            .args(&self.prefix)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.program))
    }

    /// Run and require a zero exit status; stderr becomes the error text.
    async fn run_ok(&self, args: &[&str]) -> Result<Output, String> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("{} exited with {}", args[0], output.status)
            } else {
                stderr
            })
        }
    }

    /// Names of all live sessions. A missing server (no sessions yet) and a
    /// failing binary both read as an empty list.
    pub async fn list_sessions(&self) -> Vec<String> {
        match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("list-sessions failed: {e}");
                Vec::new()
            }
        }
    }

    pub async fn has_session(&self, name: &str) -> bool {
        let target = exact(name);
        matches!(self.run(&["has-session", "-t", &target]).await, Ok(o) if o.status.success())
    }

    /// Create a detached session.
    pub async fn new_session(&self, name: &str) -> Result<(), String> {
        self.run_ok(&["new-session", "-d", "-s", name]).await.map(drop)
    }

    pub async fn set_option(&self, name: &str, option: &str, value: &str) -> Result<(), String> {
        let target = exact(name);
        self.run_ok(&["set-option", "-t", &target, option, value])
            .await
            .map(drop)
    }

    /// Apply the display options every new session gets.
    pub async fn apply_defaults(&self, name: &str) -> Result<(), String> {
        self.set_option(name, "mouse", "on").await?;
        self.set_option(name, "history-limit", &self.history_lines.to_string())
            .await
    }

    /// Type `command` into the session's active pane and press Enter.
    pub async fn send_command(&self, name: &str, command: &str) -> Result<(), String> {
        let target = pane(name);
        self.run_ok(&["send-keys", "-t", &target, command, "Enter"])
            .await
            .map(drop)
    }

    /// Scrollback of the active pane, up to the configured history depth.
    pub async fn capture(&self, name: &str) -> Result<String, String> {
        let target = pane(name);
        let start = format!("-{}", self.history_lines);
        let output = self
            .run_ok(&["capture-pane", "-p", "-t", &target, "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn kill_session(&self, name: &str) -> Result<(), String> {
        let target = exact(name);
        self.run_ok(&["kill-session", "-t", &target]).await.map(drop)
    }

    /// Program and arguments for an attach client, run on a PTY slave.
    pub fn attach_command(&self, name: &str) -> (String, Vec<String>) {
        let mut args = self.prefix.clone();
        args.extend(["attach-session".to_string(), "-t".to_string(), exact(name)]);
        (self.program.clone(), args)
    }
}

fn exact(name: &str) -> String {
    format!("={name}")
}

fn pane(name: &str) -> String {
    format!("={name}:")
}
