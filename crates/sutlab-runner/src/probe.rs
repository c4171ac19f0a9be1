use serde::Serialize;
use std::time::Duration;
use sutlab_core::{Clock, HostTarget};
use sutlab_remote::{quote_path, ExecutionMode, RemoteCommand, SessionClient};
use thiserror::Error;

/// Host-observable condition a readiness check waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPredicate {
    /// A file or directory exists on the host.
    ArtifactExists { host: HostTarget, path: String },
    /// `command` prints an integer that reaches `threshold`.
    MinimumCount {
        host: HostTarget,
        command: String,
        threshold: u64,
    },
}

impl ReadinessPredicate {
    pub fn host(&self) -> &HostTarget {
        match self {
            ReadinessPredicate::ArtifactExists { host, .. }
            | ReadinessPredicate::MinimumCount { host, .. } => host,
        }
    }
}

/// Bounded two-tier poll: wait `interval`, evaluate, then wait
/// `escalation_interval` before each further evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub predicate: ReadinessPredicate,
    pub max_attempts: u32,
    pub interval: Duration,
    pub escalation_interval: Duration,
}

impl ReadinessCheck {
    pub fn single(predicate: ReadinessPredicate, settle: Duration) -> Self {
        Self {
            predicate,
            max_attempts: 1,
            interval: settle,
            escalation_interval: Duration::ZERO,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn budget(&self) -> Duration {
        let escalations = self.max_attempts.saturating_sub(1);
        self.interval + self.escalation_interval * escalations
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "readiness", rename_all = "snake_case")]
pub enum Readiness {
    Ready {
        attempts: u32,
        observed: Option<u64>,
    },
    NotReady {
        attempts: u32,
        observed: Option<u64>,
        last_error: Option<String>,
    },
}

impl Readiness {
    pub fn observed(&self) -> Option<u64> {
        match self {
            Readiness::Ready { observed, .. } | Readiness::NotReady { observed, .. } => *observed,
        }
    }

    pub fn into_result(self) -> Result<Readiness, ReadinessTimeout> {
        match self {
            Readiness::NotReady {
                attempts,
                observed,
                last_error,
            } => Err(ReadinessTimeout {
                attempts,
                observed,
                last_error,
            }),
            ready => Ok(ready),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("readiness_timeout: not ready after {attempts} attempt(s), last observed {observed:?}")]
pub struct ReadinessTimeout {
    pub attempts: u32,
    pub observed: Option<u64>,
    pub last_error: Option<String>,
}

enum Evaluation {
    Satisfied(Option<u64>),
    Unsatisfied(Option<u64>),
    ReadFailed(String),
}

pub struct ReadinessProber<'a> {
    client: &'a dyn SessionClient,
    clock: &'a dyn Clock,
}

impl<'a> ReadinessProber<'a> {
    pub fn new(client: &'a dyn SessionClient, clock: &'a dyn Clock) -> Self {
        Self { client, clock }
    }

    pub fn wait_until_ready(&self, check: &ReadinessCheck) -> Readiness {
        let max_attempts = check.max_attempts.max(1);
        let host = check.predicate.host();
        let mut observed = None;
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let delay = if attempt == 1 {
                check.interval
            } else {
                check.escalation_interval
            };
            self.clock.sleep(delay);
            match self.evaluate(&check.predicate) {
                Evaluation::Satisfied(value) => {
                    tracing::debug!(host = %host, attempt, observed = ?value, "readiness satisfied");
                    return Readiness::Ready {
                        attempts: attempt,
                        observed: value,
                    };
                }
                Evaluation::Unsatisfied(value) => {
                    tracing::info!(host = %host, attempt, max_attempts, observed = ?value, "not ready yet");
                    observed = value;
                }
                Evaluation::ReadFailed(detail) => {
                    tracing::warn!(host = %host, attempt, max_attempts, error = %detail, "readiness read failed");
                    last_error = Some(detail);
                }
            }
        }
        Readiness::NotReady {
            attempts: max_attempts,
            observed,
            last_error,
        }
    }

    fn evaluate(&self, predicate: &ReadinessPredicate) -> Evaluation {
        match predicate {
            ReadinessPredicate::ArtifactExists { host, path } => {
                let command = RemoteCommand::new(format!("test -e {}", quote_path(path)));
                match self
                    .client
                    .execute(host, &command, &ExecutionMode::Foreground)
                {
                    Ok(_) => Evaluation::Satisfied(None),
                    Err(err) if err.is_connection() => Evaluation::ReadFailed(err.to_string()),
                    Err(_) => Evaluation::Unsatisfied(None),
                }
            }
            ReadinessPredicate::MinimumCount {
                host,
                command,
                threshold,
            } => {
                let command = RemoteCommand::new(command.clone());
                let result = match self
                    .client
                    .execute(host, &command, &ExecutionMode::Foreground)
                {
                    Ok(result) => result,
                    Err(err) => return Evaluation::ReadFailed(err.to_string()),
                };
                match parse_count(&result.stdout) {
                    Some(count) if count >= *threshold => Evaluation::Satisfied(Some(count)),
                    Some(count) => Evaluation::Unsatisfied(Some(count)),
                    None => Evaluation::ReadFailed(format!(
                        "count output is not an integer: {:?}",
                        result.stdout.trim()
                    )),
                }
            }
        }
    }
}

/// Last non-empty line of the output, as an integer.
fn parse_count(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .and_then(|line| line.parse::<u64>().ok())
}
