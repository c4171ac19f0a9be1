use crate::hosts::HostTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Load level of a run, e.g. a target CPU percentage such as "75".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workload(String);

impl Workload {
    pub fn new(level: impl Into<String>) -> Self {
        Self(level.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Workload {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The hosts a run talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHosts {
    pub sut: HostTarget,
    pub logger: HostTarget,
    /// Where the load generator runs; the controller machine when not configured.
    pub load_generator: HostTarget,
    /// Where the power meter logging script runs and writes its artifact.
    pub measurement: HostTarget,
}

impl RunHosts {
    /// Every distinct host that may hold a session or process of this run,
    /// the controller machine last.
    pub fn involved(&self) -> Vec<HostTarget> {
        let mut hosts: Vec<HostTarget> = Vec::new();
        for host in [
            &self.sut,
            &self.logger,
            &self.load_generator,
            &self.measurement,
            &HostTarget::local(),
        ] {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        if let Some(pos) = hosts.iter().position(HostTarget::is_local) {
            let local = hosts.remove(pos);
            hosts.push(local);
        }
        hosts
    }

    /// Remote hosts only.
    pub fn remote(&self) -> Vec<HostTarget> {
        self.involved()
            .into_iter()
            .filter(|host| !host.is_local())
            .collect()
    }
}

/// Per-run state handed through every phase.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    workload: Workload,
    hosts: RunHosts,
    discard: bool,
    discard_reason: Option<String>,
    load_elapsed: Option<Duration>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, workload: Workload, hosts: RunHosts) -> Self {
        Self {
            run_id: run_id.into(),
            workload,
            hosts,
            discard: false,
            discard_reason: None,
            load_elapsed: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn hosts(&self) -> &RunHosts {
        &self.hosts
    }

    pub fn is_discarded(&self) -> bool {
        self.discard
    }

    pub fn discard_reason(&self) -> Option<&str> {
        self.discard_reason.as_deref()
    }

    /// Marks the run invalid. The first reason is kept; later calls only
    /// confirm the flag.
    pub fn mark_discard(&mut self, reason: impl Into<String>) {
        if !self.discard {
            self.discard = true;
            self.discard_reason = Some(reason.into());
        }
    }

    /// Clears the flag at the start of a run. Called from BEFORE_RUN only.
    pub fn begin_run(&mut self) {
        self.discard = false;
        self.discard_reason = None;
        self.load_elapsed = None;
    }

    pub fn load_elapsed(&self) -> Option<Duration> {
        self.load_elapsed
    }

    pub fn record_load_elapsed(&mut self, elapsed: Duration) {
        self.load_elapsed = Some(elapsed);
    }
}
