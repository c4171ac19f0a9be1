use crate::{
    quote_path, shell_quote, tmux_new_detached, CommandResult, ExecutionMode, RemoteCommand, RemoteError,
    SessionClient,
};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sutlab_core::{HostRegistry, HostTarget, Secret};

const SSH_CONNECTION_EXIT: i32 = 255;
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN_EXIT: i32 = 6;
const SSHPASS_HOST_KEY_CHANGED_EXIT: i32 = 7;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    /// Upper bound for a foreground command without its own timeout.
    pub command_timeout: Duration,
    pub strict_host_key_checking: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            strict_host_key_checking: false,
        }
    }
}

/// Runs commands over `ssh` (password auth through `sshpass -e`) and the
/// `local` alias through `bash -c`. Credentials are resolved on every call and
/// dropped when it returns.
#[derive(Clone)]
pub struct SshSessionClient {
    registry: Arc<dyn HostRegistry>,
    settings: SshSettings,
}

impl SshSessionClient {
    pub fn new(registry: Arc<dyn HostRegistry>, settings: SshSettings) -> Self {
        Self { registry, settings }
    }

    fn ssh_options(&self) -> Vec<String> {
        let strict = if self.settings.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        vec![
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", strict),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            ),
        ]
    }

    fn privileged_secret(&self, host: &HostTarget) -> Result<Secret, RemoteError> {
        if host.is_local() {
            return Ok(self.registry.resolve_login(host.alias())?.secret);
        }
        Ok(self.registry.resolve(host.alias())?.secret)
    }

    fn render_line(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        mode: &ExecutionMode,
    ) -> Result<String, RemoteError> {
        let mut line = command.line.clone();
        if command.privileged {
            let secret = self.privileged_secret(host)?;
            line = render_privileged(&line, &secret);
        }
        // `cd` runs as the login user so `~` is that user's home, not root's.
        if let Some(dir) = command.workdir.as_deref() {
            line = format!("cd {} && {}", quote_path(dir), line);
        }
        if let ExecutionMode::Background { session } = mode {
            line = tmux_new_detached(session, &line);
        }
        Ok(line)
    }

    fn build_command(&self, host: &HostTarget, line: &str) -> Result<Command, RemoteError> {
        if host.is_local() {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(line);
            return Ok(cmd);
        }
        let resolved = self.registry.resolve(host.alias())?;
        let mut cmd = Command::new("sshpass");
        cmd.arg("-e").arg("ssh");
        cmd.args(self.ssh_options());
        cmd.arg(format!("{}@{}", resolved.principal, resolved.address));
        cmd.arg("--").arg(line);
        cmd.env("SSHPASS", resolved.secret.expose());
        Ok(cmd)
    }

    fn run(
        &self,
        host: &HostTarget,
        cmd: Command,
        timeout: Duration,
    ) -> Result<CommandResult, RemoteError> {
        let result = run_with_deadline(cmd, timeout).map_err(|err| match err {
            DeadlineError::Spawn(detail) => RemoteError::Connection {
                host: host.alias().to_string(),
                detail,
            },
            DeadlineError::Expired => RemoteError::Timeout {
                host: host.alias().to_string(),
                timeout,
            },
        })?;
        classify_exit(host, result)
    }
}

impl SessionClient for SshSessionClient {
    fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        mode: &ExecutionMode,
    ) -> Result<CommandResult, RemoteError> {
        let line = self.render_line(host, command, mode)?;
        tracing::debug!(host = %host, mode = ?mode, privileged = command.privileged, "executing command");
        let cmd = self.build_command(host, &line)?;
        let timeout = command.timeout.unwrap_or(self.settings.command_timeout);
        self.run(host, cmd, timeout)
    }

    fn fetch(
        &self,
        host: &HostTarget,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<CommandResult, RemoteError> {
        let destination = format!("{}/", local_dir.display());
        let cmd = if host.is_local() {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(format!(
                "cp -r {} {}",
                remote_path,
                shell_quote(&destination)
            ));
            cmd
        } else {
            let resolved = self.registry.resolve(host.alias())?;
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg("scp").arg("-r");
            cmd.args(self.ssh_options());
            cmd.arg(format!(
                "{}@{}:{}",
                resolved.principal, resolved.address, remote_path
            ));
            cmd.arg(&destination);
            cmd.env("SSHPASS", resolved.secret.expose());
            cmd
        };
        self.run(host, cmd, self.settings.command_timeout)
    }

    fn open_tunnel(
        &self,
        via: &HostTarget,
        local_port: u16,
        target: &str,
        session: &str,
    ) -> Result<CommandResult, RemoteError> {
        let resolved = self.registry.resolve(via.alias())?;
        let forward = format!(
            "sshpass -e ssh -N {} -L {}:{} {}@{}",
            self.ssh_options().join(" "),
            local_port,
            target,
            resolved.principal,
            resolved.address
        );
        let mut cmd = Command::new("tmux");
        cmd.args(["new", "-s", session, "-d", "-e"]);
        cmd.arg(format!("SSHPASS={}", resolved.secret.expose()));
        cmd.arg(forward);
        self.run(&HostTarget::local(), cmd, self.settings.command_timeout)
    }
}

/// `sudo -S` with an empty prompt so the password prompt does not pollute
/// stderr.
pub fn render_privileged(line: &str, secret: &Secret) -> String {
    format!(
        "echo {} | sudo -S -p '' sh -c {}",
        shell_quote(secret.expose()),
        shell_quote(line)
    )
}

fn classify_exit(host: &HostTarget, result: CommandResult) -> Result<CommandResult, RemoteError> {
    let host_name = host.alias().to_string();
    if !result.is_failure() {
        return Ok(result);
    }
    if !host.is_local() {
        let detail = match result.exit_status {
            SSH_CONNECTION_EXIT => Some(format!("ssh failed: {}", result.stderr_summary())),
            SSHPASS_BAD_PASSWORD_EXIT => Some("authentication failed".to_string()),
            SSHPASS_HOST_KEY_UNKNOWN_EXIT | SSHPASS_HOST_KEY_CHANGED_EXIT => {
                Some(format!("host key rejected: {}", result.stderr_summary()))
            }
            _ => None,
        };
        if let Some(detail) = detail {
            return Err(RemoteError::Connection {
                host: host_name,
                detail,
            });
        }
    }
    Err(RemoteError::CommandFailure {
        host: host_name,
        result,
    })
}

#[derive(Debug)]
enum DeadlineError {
    Spawn(String),
    Expired,
}

fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<CommandResult, DeadlineError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let program = cmd.get_program().to_string_lossy().to_string();
    let mut child = cmd
        .spawn()
        .map_err(|err| DeadlineError::Spawn(format!("failed to spawn {}: {}", program, err)))?;

    let stdout_reader = drain(&mut child, true);
    let stderr_reader = drain(&mut child, false);

    // Too far in the future to represent means no deadline.
    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DeadlineError::Expired);
        }
        thread::sleep(Duration::from_millis(25));
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    Ok(CommandResult {
        exit_status: status.and_then(|s| s.code()).unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn drain(child: &mut Child, stdout: bool) -> Option<thread::JoinHandle<String>> {
    let mut reader: Box<dyn Read + Send> = if stdout {
        Box::new(child.stdout.take()?)
    } else {
        Box::new(child.stderr.take()?)
    };
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutlab_core::StaticHostRegistry;

    fn local_client(command_timeout: Duration) -> SshSessionClient {
        SshSessionClient::new(
            Arc::new(StaticHostRegistry::new().with_host("local", "localhost", "me", "pw")),
            SshSettings {
                command_timeout,
                ..SshSettings::default()
            },
        )
    }

    #[test]
    fn local_foreground_captures_streams_and_status() {
        let client = local_client(Duration::from_secs(10));
        let ok = client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("echo 68"),
                &ExecutionMode::Foreground,
            )
            .expect("echo succeeds");
        assert_eq!(ok.stdout.trim(), "68");
        assert_eq!(ok.exit_status, 0);

        let err = client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("echo boom >&2; exit 3"),
                &ExecutionMode::Foreground,
            )
            .expect_err("non-zero exit");
        match err {
            RemoteError::CommandFailure { result, .. } => {
                assert_eq!(result.exit_status, 3);
                assert_eq!(result.stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn error_output_marks_a_zero_exit_as_failed() {
        let client = local_client(Duration::from_secs(10));
        let err = client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("echo 'compose: error' >&2; exit 0"),
                &ExecutionMode::Foreground,
            )
            .expect_err("stderr output is a failure");
        match err {
            RemoteError::CommandFailure { result, .. } => {
                assert_eq!(result.exit_status, 0);
                assert_eq!(result.stderr.trim(), "compose: error");
            }
            other => panic!("unexpected error: {}", other),
        }
        let err = classify_exit(&HostTarget::new("GL6"), CommandResult::failed(0, "warning"))
            .expect_err("remote stderr is a failure too");
        assert!(!err.is_connection());
    }

    #[test]
    fn unrepresentable_timeouts_mean_no_deadline() {
        let client = local_client(Duration::from_secs(10));
        let out = client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("true").with_timeout(Duration::from_secs(u64::MAX)),
                &ExecutionMode::Foreground,
            )
            .expect("runs to completion");
        assert_eq!(out.exit_status, 0);
    }

    #[test]
    fn workdir_is_entered_outside_sudo() {
        let client = local_client(Duration::from_secs(10));
        let line = client
            .render_line(
                &HostTarget::local(),
                &RemoteCommand::new("docker compose up -d")
                    .in_dir("~/tts-thesis")
                    .privileged(),
                &ExecutionMode::Foreground,
            )
            .expect("renders");
        assert_eq!(
            line,
            "cd ~/tts-thesis && echo pw | sudo -S -p '' sh -c 'docker compose up -d'"
        );
    }

    #[test]
    fn foreground_commands_are_bounded_by_timeout() {
        let client = local_client(Duration::from_secs(30));
        let started = Instant::now();
        let err = client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("sleep 5").with_timeout(Duration::from_millis(150)),
                &ExecutionMode::Foreground,
            )
            .expect_err("times out");
        assert!(matches!(err, RemoteError::Timeout { .. }));
        assert!(err.is_connection());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn background_and_privileged_lines_are_wrapped_in_order() {
        let client = local_client(Duration::from_secs(10));
        let line = client
            .render_line(
                &HostTarget::local(),
                &RemoteCommand::new("docker compose up -d").privileged(),
                &ExecutionMode::background("deployment"),
            )
            .expect("renders");
        assert!(line.starts_with("tmux new -s deployment -d "));
        assert!(line.contains("sudo -S -p"));
        assert!(line.contains("docker compose up -d"));
    }

    #[test]
    fn ssh_exit_codes_map_to_connection_errors() {
        let host = HostTarget::new("GL6");
        let err = classify_exit(&host, CommandResult::failed(255, "Connection refused"))
            .expect_err("255 is ssh");
        assert!(err.is_connection());
        let err = classify_exit(&host, CommandResult::failed(5, "")).expect_err("bad password");
        assert_eq!(err.to_string(), "connection_error: GL6: authentication failed");
        let err = classify_exit(&host, CommandResult::failed(1, "nope")).expect_err("plain failure");
        assert!(matches!(err, RemoteError::CommandFailure { .. }));
        let local = classify_exit(&HostTarget::local(), CommandResult::failed(255, ""))
            .expect_err("local 255 is a command failure");
        assert!(!local.is_connection());
    }

    #[test]
    fn missing_credentials_surface_as_configuration_errors() {
        let client = SshSessionClient::new(
            Arc::new(StaticHostRegistry::new()),
            SshSettings::default(),
        );
        let err = client
            .execute(
                &HostTarget::new("GL6"),
                &RemoteCommand::new("true"),
                &ExecutionMode::Foreground,
            )
            .expect_err("unknown host");
        assert!(matches!(err, RemoteError::Configuration(_)));
    }
}
