pub mod config;
pub mod controller;
pub mod harness;
pub mod probe;
pub mod sink;

pub use config::{
    load_experiment, render_template, ExperimentConfig, LoadedExperiment, RunTable,
    TransportSettings, WorkloadProfile,
};
pub use controller::{
    ControllerSettings, InterruptReason, Phase, RunInterrupted, RunLifecycleController,
    RunOutcome,
};
pub use harness::{
    describe_experiment, preflight_experiment, preflight_hosts, run_experiment, ArtifactCounts,
    ExperimentReport, ExperimentRunner, ExperimentSummary, PreflightReport, RunOptions,
};
pub use probe::{Readiness, ReadinessCheck, ReadinessPredicate, ReadinessProber, ReadinessTimeout};
pub use sink::{
    BufferedEventSink, EventKind, EventRow, EventSink, JsonlEventSink, RunRecord, RunStatus,
};
