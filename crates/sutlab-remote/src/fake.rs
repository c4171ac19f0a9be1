use crate::{CommandResult, ExecutionMode, RemoteCommand, RemoteError, SessionClient};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sutlab_core::{HostTarget, ManualClock};

/// Scripted answer for commands matching a rule.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Ok(CommandResult),
    Fail(CommandResult),
    Connection(String),
    Timeout,
}

impl FakeResponse {
    pub fn stdout(text: &str) -> Self {
        FakeResponse::Ok(CommandResult::with_stdout(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Execute,
    Fetch,
    Tunnel,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub host: String,
    pub line: String,
    pub privileged: bool,
    pub workdir: Option<String>,
    pub mode: ExecutionMode,
}

impl RecordedCall {
    pub fn session(&self) -> Option<&str> {
        self.mode.session()
    }
}

struct FakeRule {
    host: Option<String>,
    pattern: String,
    responses: VecDeque<FakeResponse>,
    advance: Option<Duration>,
}

#[derive(Default)]
struct FakeSessionState {
    rules: Vec<FakeRule>,
    calls: Vec<RecordedCall>,
}

/// In-process stand-in for the remote hosts. Records every call and answers
/// from rules matched by host and command substring; unmatched commands
/// succeed with empty output.
#[derive(Clone, Default)]
pub struct FakeSessionClient {
    state: Arc<Mutex<FakeSessionState>>,
    clock: Option<Arc<ManualClock>>,
}

impl FakeSessionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn respond(self, pattern: &str, response: FakeResponse) -> Self {
        self.push_rule(None, pattern, vec![response], None)
    }

    pub fn respond_on(self, host: &str, pattern: &str, response: FakeResponse) -> Self {
        self.push_rule(Some(host), pattern, vec![response], None)
    }

    /// Answers successive matches in order; the last response repeats.
    pub fn respond_sequence(self, pattern: &str, responses: Vec<FakeResponse>) -> Self {
        self.push_rule(None, pattern, responses, None)
    }

    /// Moves the shared manual clock forward whenever a matching command runs.
    pub fn takes(self, pattern: &str, duration: Duration) -> Self {
        self.push_rule(
            None,
            pattern,
            vec![FakeResponse::Ok(CommandResult::success())],
            Some(duration),
        )
    }

    fn push_rule(
        self,
        host: Option<&str>,
        pattern: &str,
        responses: Vec<FakeResponse>,
        advance: Option<Duration>,
    ) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.rules.push(FakeRule {
                host: host.map(str::to_string),
                pattern: pattern.to_string(),
                responses: responses.into_iter().collect(),
                advance,
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.line).collect()
    }

    pub fn calls_matching(&self, pattern: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.line.contains(pattern))
            .collect()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|call| call.line.contains(pattern))
    }

    fn answer(&self, call: RecordedCall) -> Result<CommandResult, RemoteError> {
        let host = call.host.clone();
        let (response, advance) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => {
                    return Err(RemoteError::Connection {
                        host,
                        detail: "fake session state lock poisoned".to_string(),
                    })
                }
            };
            let matched = state.rules.iter_mut().find(|rule| {
                rule.host.as_deref().map(|h| h == call.host).unwrap_or(true)
                    && call.line.contains(&rule.pattern)
            });
            let picked = match matched {
                Some(rule) => {
                    let response = if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    };
                    (response, rule.advance)
                }
                None => (None, None),
            };
            state.calls.push(call);
            picked
        };
        if let (Some(clock), Some(advance)) = (self.clock.as_ref(), advance) {
            clock.advance(advance);
        }
        match response.unwrap_or(FakeResponse::Ok(CommandResult::success())) {
            FakeResponse::Ok(result) if result.is_failure() => {
                Err(RemoteError::CommandFailure { host, result })
            }
            FakeResponse::Ok(result) => Ok(result),
            FakeResponse::Fail(result) => Err(RemoteError::CommandFailure { host, result }),
            FakeResponse::Connection(detail) => Err(RemoteError::Connection { host, detail }),
            FakeResponse::Timeout => Err(RemoteError::Timeout {
                host,
                timeout: Duration::from_secs(0),
            }),
        }
    }
}

impl SessionClient for FakeSessionClient {
    fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        mode: &ExecutionMode,
    ) -> Result<CommandResult, RemoteError> {
        self.answer(RecordedCall {
            kind: CallKind::Execute,
            host: host.alias().to_string(),
            line: command.line.clone(),
            privileged: command.privileged,
            workdir: command.workdir.clone(),
            mode: mode.clone(),
        })
    }

    fn fetch(
        &self,
        host: &HostTarget,
        remote_path: &str,
        local_dir: &Path,
    ) -> Result<CommandResult, RemoteError> {
        self.answer(RecordedCall {
            kind: CallKind::Fetch,
            host: host.alias().to_string(),
            line: format!("fetch {} {}", remote_path, local_dir.display()),
            privileged: false,
            workdir: None,
            mode: ExecutionMode::Foreground,
        })
    }

    fn open_tunnel(
        &self,
        via: &HostTarget,
        local_port: u16,
        target: &str,
        session: &str,
    ) -> Result<CommandResult, RemoteError> {
        self.answer(RecordedCall {
            kind: CallKind::Tunnel,
            host: via.alias().to_string(),
            line: format!("tunnel {}:{}", local_port, target),
            privileged: false,
            workdir: None,
            mode: ExecutionMode::background(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutlab_core::Clock;

    #[test]
    fn sequence_rules_repeat_their_last_answer() {
        let client = FakeSessionClient::new().respond_sequence(
            "docker ps",
            vec![FakeResponse::stdout("12"), FakeResponse::stdout("70")],
        );
        let host = HostTarget::new("GL6");
        let cmd = RemoteCommand::new("docker ps | wc -l");
        let mut seen = Vec::new();
        for _ in 0..3 {
            let out = client
                .execute(&host, &cmd, &ExecutionMode::Foreground)
                .expect("scripted");
            seen.push(out.stdout);
        }
        assert_eq!(seen, vec!["12", "70", "70"]);
        assert_eq!(client.calls().len(), 3);
    }

    #[test]
    fn error_output_fails_like_the_ssh_client() {
        let client = FakeSessionClient::new().respond(
            "docker compose",
            FakeResponse::Ok(CommandResult::failed(0, "compose: error")),
        );
        let err = client
            .execute(
                &HostTarget::new("GL6"),
                &RemoteCommand::new("docker compose up -d"),
                &ExecutionMode::Foreground,
            )
            .expect_err("stderr marks the action failed");
        assert!(matches!(err, RemoteError::CommandFailure { .. }));
    }

    #[test]
    fn host_scoped_rules_only_match_their_host() {
        let client = FakeSessionClient::new().respond_on(
            "GL3",
            "kill-server",
            FakeResponse::Connection("unreachable".to_string()),
        );
        let cmd = RemoteCommand::new("tmux kill-server");
        assert!(client
            .execute(&HostTarget::new("GL6"), &cmd, &ExecutionMode::Foreground)
            .is_ok());
        let err = client
            .execute(&HostTarget::new("GL3"), &cmd, &ExecutionMode::Foreground)
            .expect_err("scripted failure");
        assert!(err.is_connection());
    }

    #[test]
    fn timed_rules_advance_the_shared_clock() {
        let clock = Arc::new(ManualClock::new());
        let client = FakeSessionClient::new()
            .with_clock(clock.clone())
            .takes("k6 run", Duration::from_secs(300));
        let start = clock.now();
        client
            .execute(
                &HostTarget::local(),
                &RemoteCommand::new("k6 run script.js"),
                &ExecutionMode::Foreground,
            )
            .expect("load step");
        assert_eq!(clock.now() - start, Duration::from_secs(300));
    }
}
