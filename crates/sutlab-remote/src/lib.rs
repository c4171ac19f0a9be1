use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sutlab_core::{ConfigurationError, HostTarget};
use thiserror::Error;

pub mod fake;
pub mod ssh;

pub use fake::{CallKind, FakeResponse, FakeSessionClient, RecordedCall};
pub use ssh::{SshSessionClient, SshSettings};

/// Exit status and captured streams of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_status: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// A non-zero exit or any error output counts as a failed action.
    pub fn is_failure(&self) -> bool {
        self.exit_status != 0 || !self.stderr.trim().is_empty()
    }

    pub fn stderr_summary(&self) -> String {
        let trimmed = self.stderr.trim();
        if trimmed.is_empty() {
            return "<no stderr>".to_string();
        }
        const MAX_STDERR_CHARS: usize = 240;
        let flat = trimmed.replace('\n', " ");
        if flat.chars().count() <= MAX_STDERR_CHARS {
            return flat;
        }
        flat.chars().take(MAX_STDERR_CHARS).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Foreground,
    /// Detached inside a named tmux session on the target host.
    Background { session: String },
}

impl ExecutionMode {
    pub fn background(session: impl Into<String>) -> Self {
        ExecutionMode::Background {
            session: session.into(),
        }
    }

    pub fn session(&self) -> Option<&str> {
        match self {
            ExecutionMode::Foreground => None,
            ExecutionMode::Background { session } => Some(session),
        }
    }
}

/// A shell command line addressed to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub line: String,
    /// Run under `sudo`, fed the host's secret at call time.
    pub privileged: bool,
    /// Overrides the client's default foreground timeout.
    pub timeout: Option<Duration>,
    /// Entered as the login user before the line runs, outside any `sudo`.
    pub workdir: Option<String>,
}

impl RemoteCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            privileged: false,
            timeout: None,
            workdir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("connection_error: {host}: {detail}")]
    Connection { host: String, detail: String },
    #[error("command_timeout: {host}: no exit after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
    #[error("command_failure: {host}: exit status {}: {}", .result.exit_status, .result.stderr_summary())]
    CommandFailure { host: String, result: CommandResult },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

const NOT_FOUND_MARKERS: &[&str] = &[
    "no server running",
    "error connecting to",
    "can't find session",
    "session not found",
    "no such process",
    "no process found",
];

impl RemoteError {
    /// Connection-class failures end the current phase.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection { .. } | RemoteError::Timeout { .. }
        )
    }

    /// The command only reported that the thing it was asked to stop does not
    /// exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::CommandFailure { result, .. } => {
                let stderr = result.stderr.to_ascii_lowercase();
                NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
            }
            _ => false,
        }
    }
}

/// Command channel to named hosts.
pub trait SessionClient: Send + Sync {
    fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        mode: &ExecutionMode,
    ) -> Result<CommandResult, RemoteError>;

    /// Copies `remote_path` (may be a glob) from `host` into `local_dir`.
    fn fetch(
        &self,
        host: &HostTarget,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<CommandResult, RemoteError>;

    /// Starts a port forward `local_port -> target` through `via`, detached in
    /// a local session named `session`.
    fn open_tunnel(
        &self,
        via: &HostTarget,
        local_port: u16,
        target: &str,
        session: &str,
    ) -> Result<CommandResult, RemoteError>;
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Quotes a path but keeps a leading `~/` expandable.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

pub fn tmux_new_detached(session: &str, line: &str) -> String {
    format!("tmux new -s {} -d {}", shell_quote(session), shell_quote(line))
}

pub fn tmux_kill_session(session: &str) -> String {
    format!("tmux kill-session -t {}", shell_quote(session))
}

pub fn tmux_kill_server() -> String {
    "tmux kill-server".to_string()
}

/// Kills every process whose command line matches `pattern`. Exits 0 when
/// nothing matched.
pub fn kill_by_pattern(pattern: &str) -> String {
    format!("pgrep -f {} | xargs -r kill", shell_quote(&self_excluding(pattern)))
}

/// `k6 run` becomes `[k]6 run`: same matches, but not the shell carrying the
/// pattern on its own command line.
fn self_excluding(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            format!("[{}]{}", first, chars.as_str())
        }
        _ => pattern.to_string(),
    }
}

/// Outcome of a best-effort cleanup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    NothingToClean,
    Failed,
}

/// Runs a cleanup command, treating "not found" as success and logging any
/// other failure. Never returns an error.
pub fn run_cleanup(
    client: &dyn SessionClient,
    host: &HostTarget,
    command: &RemoteCommand,
    what: &str,
) -> CleanupOutcome {
    match client.execute(host, command, &ExecutionMode::Foreground) {
        Ok(result) => {
            if !result.stderr.trim().is_empty() {
                tracing::debug!(host = %host, what, stderr = %result.stderr_summary(), "cleanup wrote to stderr");
            }
            CleanupOutcome::Done
        }
        Err(err) if err.is_not_found() => {
            tracing::debug!(host = %host, what, "nothing to clean up");
            CleanupOutcome::NothingToClean
        }
        Err(err) => {
            tracing::warn!(host = %host, what, error = %err, "cleanup failed; continuing");
            CleanupOutcome::Failed
        }
    }
}
