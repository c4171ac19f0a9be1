use crate::config::{render_template, WorkloadProfile, PARAM_PLACEHOLDER};
use crate::config::DeploymentProfile;
use crate::probe::{ReadinessCheck, ReadinessPredicate, ReadinessProber};
use crate::sink::{EventKind, EventRow, EventSink};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use sutlab_core::{Clock, HostRegistry, HostTarget, RunContext};
use sutlab_remote::{
    kill_by_pattern, quote_path, run_cleanup, tmux_kill_server, tmux_kill_session,
    CleanupOutcome, ExecutionMode, RemoteCommand, RemoteError, SessionClient,
};
use thiserror::Error;

pub const TUNNEL_SESSION: &str = "portforwarding";
pub const DEPLOYMENT_SESSION: &str = "deployment";
pub const MEASUREMENT_SESSION: &str = "measurement";
pub const MONITOR_SESSION: &str = "monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BeforeRun,
    StartRun,
    StartMeasurement,
    Interact,
    StopMeasurement,
    StopRun,
    PopulateRunData,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeRun => "before_run",
            Phase::StartRun => "start_run",
            Phase::StartMeasurement => "start_measurement",
            Phase::Interact => "interact",
            Phase::StopMeasurement => "stop_measurement",
            Phase::StopRun => "stop_run",
            Phase::PopulateRunData => "populate_run_data",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was cut short.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterruptReason {
    #[error("deployment not ready: observed {observed:?} components, required {required}")]
    DeploymentNotReady { observed: Option<u64>, required: u64 },
    #[error("deployment launch failed: {detail}")]
    DeploymentLaunchFailed { detail: String },
    #[error("measurement service failed to start: {artifact} missing")]
    MeasurementServiceFailedToStart { artifact: String },
    #[error("host {host} unreachable during {phase}")]
    HostUnreachable { host: String, phase: Phase },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl InterruptReason {
    pub fn code(&self) -> &'static str {
        match self {
            InterruptReason::DeploymentNotReady { .. } => "deployment_not_ready",
            InterruptReason::DeploymentLaunchFailed { .. } => "deployment_launch_failed",
            InterruptReason::MeasurementServiceFailedToStart { .. } => {
                "measurement_service_failed_to_start"
            }
            InterruptReason::HostUnreachable { .. } => "host_unreachable",
            InterruptReason::Configuration(_) => "configuration_error",
        }
    }
}

/// The only error that leaves the controller. Both stop phases have already
/// run when it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run_interrupted: [{run_id}] [{workload}]: {reason}")]
pub struct RunInterrupted {
    pub run_id: String,
    pub workload: String,
    pub reason: InterruptReason,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub workload: String,
    pub discarded: bool,
    pub discard_reason: Option<String>,
    pub load_elapsed: Option<Duration>,
    /// Always `None`: measurements are collected after the experiment.
    pub data: Option<Value>,
}

/// Per-experiment values the controller needs besides the profile.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub experiment: String,
    /// Skips the SUT power-cycle when the deployment does not come up.
    pub lenient: bool,
    /// Where the measurement service writes its artifact, on the measurement host.
    pub energy_dir: PathBuf,
    pub results_dir: PathBuf,
}

pub struct RunLifecycleController<'a> {
    client: &'a dyn SessionClient,
    registry: &'a dyn HostRegistry,
    clock: &'a dyn Clock,
    profile: &'a WorkloadProfile,
    settings: &'a ControllerSettings,
    sink: &'a mut dyn EventSink,
}

impl<'a> RunLifecycleController<'a> {
    pub fn new(
        client: &'a dyn SessionClient,
        registry: &'a dyn HostRegistry,
        clock: &'a dyn Clock,
        profile: &'a WorkloadProfile,
        settings: &'a ControllerSettings,
        sink: &'a mut dyn EventSink,
    ) -> Self {
        Self {
            client,
            registry,
            clock,
            profile,
            settings,
            sink,
        }
    }

    /// Drives one run through every phase. Setup failures take the abort
    /// path: both stop phases, then `RunInterrupted`.
    pub fn run(&mut self, ctx: &mut RunContext) -> Result<RunOutcome, RunInterrupted> {
        let span = tracing::info_span!("run", run_id = ctx.run_id(), workload = %ctx.workload());
        let _entered = span.enter();

        if let Err(reason) = self.set_up(ctx) {
            return Err(self.abort(ctx, reason));
        }
        self.interact(ctx);
        self.stop_measurement(ctx);
        self.stop_run(ctx);
        let data = self.populate_run_data(ctx);
        Ok(RunOutcome {
            run_id: ctx.run_id().to_string(),
            workload: ctx.workload().to_string(),
            discarded: ctx.is_discarded(),
            discard_reason: ctx.discard_reason().map(str::to_string),
            load_elapsed: ctx.load_elapsed(),
            data,
        })
    }

    fn set_up(&mut self, ctx: &mut RunContext) -> Result<(), InterruptReason> {
        self.before_run(ctx)?;
        self.start_run(ctx)?;
        self.start_measurement(ctx)
    }

    fn abort(&mut self, ctx: &mut RunContext, reason: InterruptReason) -> RunInterrupted {
        ctx.mark_discard(reason.to_string());
        tracing::warn!(reason = %reason, "aborting run");
        self.stop_measurement(ctx);
        self.stop_run(ctx);
        self.emit(
            ctx,
            None,
            EventKind::RunInterrupted,
            format!("INTERRUPTED: {}", reason),
            json!({ "reason": reason.code() }),
        );
        RunInterrupted {
            run_id: ctx.run_id().to_string(),
            workload: ctx.workload().to_string(),
            reason,
        }
    }

    /// Resets the discard flag and clears leftover sessions on every host.
    pub fn before_run(&mut self, ctx: &mut RunContext) -> Result<(), InterruptReason> {
        ctx.begin_run();
        self.phase_started(ctx, Phase::BeforeRun);
        let command = RemoteCommand::new(tmux_kill_server());
        for host in ctx.hosts().involved() {
            match self
                .client
                .execute(&host, &command, &ExecutionMode::Foreground)
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => self.setup_failure(ctx, Phase::BeforeRun, &host, &err)?,
            }
        }
        self.emit(
            ctx,
            Some(Phase::BeforeRun),
            EventKind::SessionsCleared,
            "sessions cleared",
            Value::Null,
        );
        Ok(())
    }

    /// Opens the tunnel and, for deployment workloads, brings the deployment
    /// up and waits for it.
    pub fn start_run(&mut self, ctx: &mut RunContext) -> Result<(), InterruptReason> {
        self.phase_started(ctx, Phase::StartRun);
        let profile = self.profile;

        if let Some(tunnel) = profile.tunnel.as_ref() {
            let logger = ctx.hosts().logger.clone();
            match self
                .client
                .open_tunnel(&logger, tunnel.local_port, &tunnel.target, TUNNEL_SESSION)
            {
                Ok(_) => self.emit(
                    ctx,
                    Some(Phase::StartRun),
                    EventKind::TunnelOpened,
                    format!(
                        "port {} forwarded to {} via {}",
                        tunnel.local_port, tunnel.target, logger
                    ),
                    Value::Null,
                ),
                Err(err) => self.setup_failure(ctx, Phase::StartRun, &logger, &err)?,
            }
            self.clock.sleep(Duration::from_secs(tunnel.settle_secs));
        }

        let deployment = match profile.deployment.as_ref() {
            Some(deployment) => deployment,
            None => return Ok(()),
        };
        let sut = ctx.hosts().sut.clone();
        let vars = self.template_vars(ctx);
        let up = compose_command(deployment, render_template(&deployment.up_command, &vars));
        match self
            .client
            .execute(&sut, &up, &ExecutionMode::background(DEPLOYMENT_SESSION))
        {
            Ok(_) => self.emit(
                ctx,
                Some(Phase::StartRun),
                EventKind::DeploymentLaunched,
                "deployment launched",
                Value::Null,
            ),
            Err(err) if err.is_connection() => {
                self.setup_failure(ctx, Phase::StartRun, &sut, &err)?
            }
            Err(err) => {
                let detail = err.to_string();
                ctx.mark_discard(format!("deployment launch failed: {}", detail));
                self.emit(
                    ctx,
                    Some(Phase::StartRun),
                    EventKind::DeploymentLaunchFailed,
                    format!("FAILED launching deployment: {}", detail),
                    Value::Null,
                );
                return Err(InterruptReason::DeploymentLaunchFailed { detail });
            }
        }

        let check = ReadinessCheck {
            predicate: ReadinessPredicate::MinimumCount {
                host: sut.clone(),
                command: render_template(&deployment.count_command, &vars),
                threshold: deployment.min_component_count,
            },
            max_attempts: deployment.max_attempts,
            interval: Duration::from_secs(deployment.settle_secs),
            escalation_interval: Duration::from_secs(deployment.escalation_secs),
        };
        let readiness = ReadinessProber::new(self.client, self.clock).wait_until_ready(&check);
        let timeout = match readiness.into_result() {
            Ok(ready) => {
                self.emit(
                    ctx,
                    Some(Phase::StartRun),
                    EventKind::DeploymentReady,
                    format!("deployment ready with {:?} components", ready.observed()),
                    serde_json::to_value(&ready).unwrap_or(Value::Null),
                );
                return Ok(());
            }
            Err(timeout) => timeout,
        };

        tracing::warn!(host = %sut, error = %timeout, "deployment did not come up");
        let reason = InterruptReason::DeploymentNotReady {
            observed: timeout.observed,
            required: deployment.min_component_count,
        };
        ctx.mark_discard(reason.to_string());
        self.emit(
            ctx,
            Some(Phase::StartRun),
            EventKind::DeploymentNotReady,
            format!("Not enough containers. FAILED: {}", reason),
            json!({
                "attempts": timeout.attempts,
                "observed": timeout.observed,
                "error": timeout.to_string(),
            }),
        );
        if self.settings.lenient {
            tracing::info!("lenient mode: leaving {} powered on", sut);
        } else {
            self.request_power_cycle(ctx, &sut, Duration::from_secs(deployment.reboot_settle_secs));
        }
        Err(reason)
    }

    fn request_power_cycle(&mut self, ctx: &RunContext, sut: &HostTarget, settle: Duration) {
        let reboot = RemoteCommand::new("reboot")
            .privileged()
            .with_timeout(Duration::from_secs(30));
        // The connection usually drops while the host goes down.
        if let Err(err) = self
            .client
            .execute(sut, &reboot, &ExecutionMode::Foreground)
        {
            tracing::debug!(host = %sut, error = %err, "reboot returned an error");
        }
        self.emit(
            ctx,
            Some(Phase::StartRun),
            EventKind::RebootRequested,
            format!("rebooting {}", sut),
            json!({ "settle_secs": settle.as_secs() }),
        );
        self.clock.sleep(settle);
    }

    /// Starts the measurement service, checks that it writes its artifact,
    /// then starts the resource monitor.
    pub fn start_measurement(&mut self, ctx: &mut RunContext) -> Result<(), InterruptReason> {
        self.phase_started(ctx, Phase::StartMeasurement);
        let profile = self.profile;
        let measurement = &profile.measurement;
        let meter = measurement.credential_alias.as_deref().unwrap_or("measurement");
        let host = ctx.hosts().measurement.clone();
        let mut vars = self.template_vars(ctx);
        if let Some(alias) = measurement.credential_alias.as_deref() {
            let login = self
                .registry
                .resolve_login(alias)
                .map_err(|err| InterruptReason::Configuration(err.to_string()))?;
            vars.insert("METER_USER", login.principal);
            vars.insert("METER_PASSWORD", login.secret.expose().to_string());
        }

        let start = RemoteCommand::new(render_template(&measurement.start_command, &vars));
        match self
            .client
            .execute(&host, &start, &ExecutionMode::background(MEASUREMENT_SESSION))
        {
            Ok(_) => {}
            Err(err) if err.is_connection() => {
                self.setup_failure(ctx, Phase::StartMeasurement, &host, &err)?
            }
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "measurement launch reported a failure");
            }
        }

        let artifact = render_template(&measurement.artifact, &vars);
        let check = ReadinessCheck::single(
            ReadinessPredicate::ArtifactExists {
                host: host.clone(),
                path: artifact.clone(),
            },
            Duration::from_secs(measurement.settle_secs),
        );
        let readiness = ReadinessProber::new(self.client, self.clock).wait_until_ready(&check);
        if let Err(timeout) = readiness.into_result() {
            let reason = InterruptReason::MeasurementServiceFailedToStart {
                artifact: artifact.clone(),
            };
            ctx.mark_discard(reason.to_string());
            self.emit(
                ctx,
                Some(Phase::StartMeasurement),
                EventKind::MeasurementFailed,
                format!("{} FAILED: {} not found", meter, artifact),
                json!({ "artifact": artifact, "last_error": timeout.last_error }),
            );
            return Err(reason);
        }
        self.emit(
            ctx,
            Some(Phase::StartMeasurement),
            EventKind::MeasurementStarted,
            format!("{} OK", meter),
            json!({ "artifact": artifact }),
        );

        let sut = ctx.hosts().sut.clone();
        let line = self.with_load_parameter(ctx, &profile.monitor.command, "monitor");
        match self.client.execute(
            &sut,
            &RemoteCommand::new(line),
            &ExecutionMode::background(MONITOR_SESSION),
        ) {
            Ok(_) => self.emit(
                ctx,
                Some(Phase::StartMeasurement),
                EventKind::MonitorStarted,
                "monitor started",
                Value::Null,
            ),
            Err(err) if err.is_connection() => {
                self.setup_failure(ctx, Phase::StartMeasurement, &sut, &err)?
            }
            Err(err) => {
                ctx.mark_discard(format!("monitor launch failed: {}", err));
                self.emit(
                    ctx,
                    Some(Phase::StartMeasurement),
                    EventKind::MonitorLaunchFailed,
                    format!("FAILED launching monitor: {}", err),
                    Value::Null,
                );
            }
        }
        Ok(())
    }

    /// Runs the load step and discards the run when it ended implausibly fast.
    pub fn interact(&mut self, ctx: &mut RunContext) {
        self.phase_started(ctx, Phase::Interact);
        let profile = self.profile;
        let load = &profile.load;
        let host = ctx.hosts().load_generator.clone();
        let vars = self.template_vars(ctx);
        let command = RemoteCommand::new(render_template(&load.command, &vars))
            .with_timeout(Duration::from_secs(load.timeout_secs));

        let started = self.clock.now();
        let result = self
            .client
            .execute(&host, &command, &ExecutionMode::Foreground);
        let elapsed = self.clock.now().saturating_duration_since(started);
        ctx.record_load_elapsed(elapsed);

        match result {
            Ok(_) => {}
            Err(err) if err.is_connection() => {
                ctx.mark_discard(format!("load step lost {}: {}", host, err));
                self.emit(
                    ctx,
                    Some(Phase::Interact),
                    EventKind::HostUnreachable,
                    format!("FAILED during load step: {}", err),
                    Value::Null,
                );
            }
            Err(err) => {
                self.emit(
                    ctx,
                    Some(Phase::Interact),
                    EventKind::LoadFailed,
                    format!("load step reported a failure: {}", err),
                    Value::Null,
                );
            }
        }

        let minimum = profile.minimum_plausible_duration();
        if elapsed < minimum {
            ctx.mark_discard(format!(
                "load step too short: {}s < {}s",
                elapsed.as_secs(),
                minimum.as_secs()
            ));
            self.emit(
                ctx,
                Some(Phase::Interact),
                EventKind::LoadTooShort,
                format!(
                    "FAILED during load step: finished after {}s",
                    elapsed.as_secs()
                ),
                json!({ "elapsed_secs": elapsed.as_secs_f64(), "minimum_secs": minimum.as_secs() }),
            );
        } else {
            self.emit(
                ctx,
                Some(Phase::Interact),
                EventKind::LoadCompleted,
                format!("load step finished after {}s", elapsed.as_secs()),
                json!({ "elapsed_secs": elapsed.as_secs_f64() }),
            );
        }
    }

    /// Stops the measurement service (killed when discarded, stopped cleanly
    /// otherwise) and the monitor. Never fails.
    pub fn stop_measurement(&mut self, ctx: &mut RunContext) {
        self.phase_started(ctx, Phase::StopMeasurement);
        let profile = self.profile;
        let measurement = &profile.measurement;
        let monitor = &profile.monitor;
        let measurement_host = ctx.hosts().measurement.clone();
        let sut = ctx.hosts().sut.clone();

        if ctx.is_discarded() {
            run_cleanup(
                self.client,
                &measurement_host,
                &RemoteCommand::new(tmux_kill_session(MEASUREMENT_SESSION)),
                "measurement session",
            );
            run_cleanup(
                self.client,
                &measurement_host,
                &RemoteCommand::new(kill_by_pattern(&measurement.process_pattern())),
                "measurement process",
            );
        } else {
            let line = self.with_load_parameter(ctx, &measurement.stop_command, "measurement stop");
            run_cleanup(
                self.client,
                &measurement_host,
                &RemoteCommand::new(line),
                "measurement stop",
            );
            self.emit(
                ctx,
                Some(Phase::StopMeasurement),
                EventKind::MeasurementStopped,
                "measurement stopped",
                Value::Null,
            );
        }

        run_cleanup(
            self.client,
            &sut,
            &RemoteCommand::new(tmux_kill_session(MONITOR_SESSION)),
            "monitor session",
        );

        if ctx.is_discarded() && monitor.partial_artifacts > 0 {
            let line = remove_newest_files(&monitor.output_dir, monitor.partial_artifacts);
            let outcome = run_cleanup(
                self.client,
                &sut,
                &RemoteCommand::new(line),
                "partial monitor output",
            );
            if outcome == CleanupOutcome::Done {
                self.emit(
                    ctx,
                    Some(Phase::StopMeasurement),
                    EventKind::PartialArtifactsRemoved,
                    format!(
                        "removed {} newest files from {}",
                        monitor.partial_artifacts, monitor.output_dir
                    ),
                    Value::Null,
                );
            }
        }
    }

    /// Kills load and monitor processes everywhere and tears the deployment
    /// down. Never fails.
    pub fn stop_run(&mut self, ctx: &mut RunContext) {
        self.phase_started(ctx, Phase::StopRun);
        let profile = self.profile;
        let patterns = [profile.load.process_pattern(), profile.monitor.process_pattern.clone()];
        for host in ctx.hosts().involved() {
            for pattern in &patterns {
                run_cleanup(
                    self.client,
                    &host,
                    &RemoteCommand::new(kill_by_pattern(pattern)),
                    pattern,
                );
            }
        }

        let deployment = match profile.deployment.as_ref() {
            Some(deployment) => deployment,
            None => return,
        };
        let sut = ctx.hosts().sut.clone();
        let vars = self.template_vars(ctx);
        let down = compose_command(deployment, render_template(&deployment.down_command, &vars));
        let mut steps = vec![
            (
                "deployment session",
                RemoteCommand::new(tmux_kill_session(DEPLOYMENT_SESSION)),
            ),
            ("deployment down", down.clone()),
            (
                "container runtime restart",
                host_command(
                    deployment,
                    render_template(&deployment.runtime_restart_command, &vars),
                ),
            ),
            ("deployment down", down),
        ];
        if let Some(prune) = deployment.prune_command.as_deref() {
            steps.push((
                "volume prune",
                host_command(deployment, render_template(prune, &vars)),
            ));
        }
        for (what, command) in steps {
            run_cleanup(self.client, &sut, &command, what);
        }
    }

    /// Nothing is collected per run; discarded runs are reported invalid.
    pub fn populate_run_data(&mut self, ctx: &RunContext) -> Option<Value> {
        self.phase_started(ctx, Phase::PopulateRunData);
        match ctx.discard_reason() {
            Some(reason) => self.emit(
                ctx,
                Some(Phase::PopulateRunData),
                EventKind::RunDiscarded,
                format!("DISCARDED: {}", reason),
                Value::Null,
            ),
            None => self.emit(
                ctx,
                Some(Phase::PopulateRunData),
                EventKind::RunCompleted,
                "run completed",
                Value::Null,
            ),
        }
        None
    }

    /// Connection failures abort setup; anything else is logged.
    fn setup_failure(
        &mut self,
        ctx: &mut RunContext,
        phase: Phase,
        host: &HostTarget,
        err: &RemoteError,
    ) -> Result<(), InterruptReason> {
        if !err.is_connection() {
            tracing::warn!(host = %host, phase = %phase, error = %err, "command failed; continuing");
            return Ok(());
        }
        let reason = InterruptReason::HostUnreachable {
            host: host.alias().to_string(),
            phase,
        };
        ctx.mark_discard(reason.to_string());
        self.emit(
            ctx,
            Some(phase),
            EventKind::HostUnreachable,
            format!("FAILED: {} unreachable: {}", host, err),
            Value::Null,
        );
        Err(reason)
    }

    /// Appends the derived load parameter when the workload has one; the
    /// command runs without it otherwise.
    fn with_load_parameter(&mut self, ctx: &RunContext, raw: &str, step: &str) -> String {
        let vars = self.template_vars(ctx);
        let rendered = render_template(raw, &vars);
        let profile = self.profile;
        match profile.load_parameter(ctx.workload()) {
            Some(_) if raw.contains(PARAM_PLACEHOLDER) => rendered,
            Some(param) => format!("{} {}", rendered, param),
            None => {
                self.emit(
                    ctx,
                    None,
                    EventKind::ParameterFallback,
                    format!(
                        "no load parameter for workload {}; {} runs without it",
                        ctx.workload(),
                        step
                    ),
                    Value::Null,
                );
                rendered.replace(PARAM_PLACEHOLDER, "").trim_end().to_string()
            }
        }
    }

    fn template_vars(&self, ctx: &RunContext) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("SUT", ctx.hosts().sut.alias().to_string());
        vars.insert("WORKLOAD", ctx.workload().to_string());
        vars.insert(
            "DURATION",
            self.profile.measurement.duration_secs.to_string(),
        );
        vars.insert(
            "ENERGY_DIR",
            self.settings.energy_dir.display().to_string(),
        );
        vars.insert(
            "RESULTS_DIR",
            self.settings.results_dir.display().to_string(),
        );
        if let Some(param) = self.profile.load_parameter(ctx.workload()) {
            vars.insert("PARAM", param.to_string());
        }
        vars
    }

    fn phase_started(&mut self, ctx: &RunContext, phase: Phase) {
        tracing::info!(phase = %phase, "phase started");
        self.emit(
            ctx,
            Some(phase),
            EventKind::PhaseStarted,
            phase.as_str(),
            Value::Null,
        );
    }

    fn emit(
        &mut self,
        ctx: &RunContext,
        phase: Option<Phase>,
        kind: EventKind,
        message: impl Into<String>,
        payload: Value,
    ) {
        let mut row = EventRow::new(&self.settings.experiment, kind, message);
        row.run_id = Some(ctx.run_id().to_string());
        row.workload = Some(ctx.workload().to_string());
        row.phase = phase.map(|p| p.as_str().to_string());
        row.payload = payload;
        if let Err(err) = self.sink.append_event(&row) {
            tracing::warn!(error = %err, "failed to record event");
        }
    }
}

/// Runtime-level command, under sudo when the deployment asks for it.
fn host_command(deployment: &DeploymentProfile, line: String) -> RemoteCommand {
    let command = RemoteCommand::new(line);
    if deployment.privileged {
        command.privileged()
    } else {
        command
    }
}

/// Compose command, run from the deployment's working directory.
fn compose_command(deployment: &DeploymentProfile, line: String) -> RemoteCommand {
    let command = host_command(deployment, line);
    match deployment.workdir.as_deref() {
        Some(dir) => command.in_dir(dir),
        None => command,
    }
}

/// Deletes the `count` most recently modified regular files directly under
/// `dir`. Names may contain spaces but not newlines.
fn remove_newest_files(dir: &str, count: usize) -> String {
    format!(
        "find {} -maxdepth 1 -type f -printf '%T@\\t%p\\n' | sort -rn | head -n {} | cut -f2- | tr '\\n' '\\0' | xargs -0 -r rm -f --",
        quote_path(dir),
        count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::sink::BufferedEventSink;
    use std::sync::Arc;
    use sutlab_core::{ManualClock, RunHosts, StaticHostRegistry, Workload};
    use sutlab_remote::{CallKind, CommandResult, FakeResponse, FakeSessionClient};

    struct Harness {
        clock: Arc<ManualClock>,
        client: FakeSessionClient,
        registry: StaticHostRegistry,
        profile: WorkloadProfile,
        settings: ControllerSettings,
        sink: BufferedEventSink,
    }

    impl Harness {
        fn new(client: FakeSessionClient) -> Self {
            let clock = Arc::new(ManualClock::new());
            Self {
                client: client.with_clock(clock.clone()),
                clock,
                registry: StaticHostRegistry::new().with_host("RITTAL", "", "meter", "s3cret"),
                profile: sample_config().profile,
                settings: ControllerSettings {
                    experiment: "def-tts-GL6".to_string(),
                    lenient: false,
                    energy_dir: PathBuf::from("/srv/exp/results/energy"),
                    results_dir: PathBuf::from("/srv/exp/results"),
                },
                sink: BufferedEventSink::new(),
            }
        }

        fn run(&mut self, ctx: &mut RunContext) -> Result<RunOutcome, RunInterrupted> {
            let mut controller = RunLifecycleController::new(
                &self.client,
                &self.registry,
                self.clock.as_ref(),
                &self.profile,
                &self.settings,
                &mut self.sink,
            );
            controller.run(ctx)
        }

        fn index(&self, pattern: &str) -> usize {
            self.client
                .position(pattern)
                .unwrap_or_else(|| panic!("no call matching {:?}", pattern))
        }

        fn count(&self, pattern: &str) -> usize {
            self.client.calls_matching(pattern).len()
        }
    }

    fn context(workload: &str) -> RunContext {
        RunContext::new(
            "r1",
            Workload::new(workload),
            RunHosts {
                sut: HostTarget::new("GL6"),
                logger: HostTarget::new("GL3"),
                load_generator: HostTarget::new("GL5"),
                measurement: HostTarget::local(),
            },
        )
    }

    fn healthy_client() -> FakeSessionClient {
        FakeSessionClient::new()
            .respond("docker ps", FakeResponse::stdout("70\n"))
            .takes("k6 run", Duration::from_secs(300))
    }

    fn assert_stop_order(h: &Harness) {
        assert_eq!(h.count("kill-session -t monitor"), 1);
        assert!(h.index("kill-session -t monitor") < h.index("[k]6 run"));
    }

    #[test]
    fn healthy_run_stops_measurement_cleanly() {
        let mut h = Harness::new(healthy_client());
        let mut ctx = context("50");
        let outcome = h.run(&mut ctx).expect("run completes");
        assert!(!outcome.discarded);
        assert_eq!(outcome.load_elapsed, Some(Duration::from_secs(300)));
        assert!(outcome.data.is_none());

        let lines = h.client.lines();
        assert!(lines.contains(
            &"~/scripts/logging/stop_Rittal.sh GL6 /srv/exp/results/energy 50 500".to_string()
        ));
        assert!(lines.contains(
            &"cd /home/ander/scripts && ./monitor-er.sh GL6 50 500".to_string()
        ));
        assert!(lines.contains(
            &"~/scripts/logging/start_Rittal.sh GL6 900 /srv/exp/results/energy meter s3cret"
                .to_string()
        ));
        assert_eq!(h.count("kill-session -t measurement"), 0);
        assert_eq!(h.count("| head -n 2 |"), 0);
        assert_eq!(h.count("reboot"), 0);
        assert_stop_order(&h);
        assert!(h.index("stop_Rittal.sh") < h.index("kill-session -t monitor"));
        assert!(h.sink.has(EventKind::RunCompleted));
        assert!(h.sink.messages().contains(&"RITTAL OK".to_string()));

        assert_eq!(
            h.clock.sleeps(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(180),
                Duration::from_secs(12)
            ]
        );
    }

    #[test]
    fn sessions_are_cleared_on_every_host_including_local() {
        let mut h = Harness::new(healthy_client());
        h.run(&mut context("50")).expect("run completes");
        let hosts: Vec<String> = h
            .client
            .calls_matching("kill-server")
            .into_iter()
            .map(|c| c.host)
            .collect();
        assert_eq!(hosts, vec!["GL6", "GL3", "GL5", "local"]);
    }

    #[test]
    fn deployment_and_sessions_use_named_background_sessions() {
        let mut h = Harness::new(healthy_client());
        h.run(&mut context("50")).expect("run completes");
        let calls = h.client.calls();
        let session_of = |pattern: &str| {
            calls
                .iter()
                .find(|c| c.line.contains(pattern))
                .and_then(|c| c.session().map(str::to_string))
        };
        assert_eq!(session_of("up -d").as_deref(), Some(DEPLOYMENT_SESSION));
        assert_eq!(session_of("start_Rittal").as_deref(), Some(MEASUREMENT_SESSION));
        assert_eq!(session_of("monitor-er.sh GL6").as_deref(), Some(MONITOR_SESSION));
        let tunnel = calls
            .iter()
            .find(|c| c.kind == CallKind::Tunnel)
            .expect("tunnel opened");
        assert_eq!(tunnel.host, "GL3");
        assert_eq!(tunnel.line, "tunnel 8080:192.168.0.200:80");
        assert!(calls
            .iter()
            .find(|c| c.line.contains("up -d"))
            .map(|c| c.privileged)
            .unwrap_or(false));
    }

    #[test]
    fn deployment_not_ready_reboots_and_takes_abort_path() {
        let mut h = Harness::new(
            FakeSessionClient::new().respond("docker ps", FakeResponse::stdout("12")),
        );
        let mut ctx = context("75");
        let err = h.run(&mut ctx).expect_err("run interrupted");
        assert_eq!(
            err.reason,
            InterruptReason::DeploymentNotReady {
                observed: Some(12),
                required: 68
            }
        );
        assert!(ctx.is_discarded());
        assert_eq!(h.count("docker ps"), 2);
        assert_eq!(h.count("reboot"), 1);
        assert!(h.clock.sleeps().contains(&Duration::from_secs(360)));

        assert_eq!(h.count("start_Rittal"), 0);
        assert_eq!(h.count("stop_Rittal"), 0);
        assert_eq!(h.count("kill-session -t measurement"), 1);
        assert_eq!(h.count("| head -n 2 |"), 1);
        assert_stop_order(&h);
        assert!(h.index("reboot") < h.index("kill-session -t measurement"));
        assert!(h.index("| head -n 2 |") < h.index("docker compose -f docker-compose-GL6-75.yml down"));
        assert_eq!(h.count("docker-compose-GL6-75.yml down"), 2);
        assert!(h.index("systemctl stop docker") > h.index("docker-compose-GL6-75.yml down"));
        assert!(h.sink.has(EventKind::RunInterrupted));

        let not_ready = h
            .sink
            .events
            .iter()
            .find(|row| row.kind == EventKind::DeploymentNotReady)
            .expect("not-ready event");
        assert!(not_ready.message.starts_with("Not enough containers. FAILED"));
        assert_eq!(not_ready.payload["attempts"], 2);
        assert!(not_ready.payload["error"]
            .as_str()
            .expect("error text")
            .starts_with("readiness_timeout"));
        assert!(h.sink.has(EventKind::PartialArtifactsRemoved));
    }

    #[test]
    fn compose_commands_run_from_the_workdir_outside_sudo() {
        let mut h = Harness::new(
            FakeSessionClient::new().respond("docker ps", FakeResponse::stdout("12")),
        );
        h.settings.lenient = true;
        h.run(&mut context("75")).expect_err("run interrupted");
        let compose: Vec<_> = h
            .client
            .calls()
            .into_iter()
            .filter(|c| c.line.starts_with("docker compose"))
            .collect();
        assert_eq!(compose.len(), 3);
        for call in &compose {
            assert_eq!(call.workdir.as_deref(), Some("~/tts-thesis"));
            assert!(call.privileged);
        }
        let restart = h
            .client
            .calls_matching("systemctl stop docker")
            .pop()
            .expect("runtime restarted");
        assert_eq!(restart.workdir, None);
    }

    #[test]
    fn partial_output_removal_only_takes_the_newest_regular_files() {
        assert_eq!(
            remove_newest_files("~/results dir", 2),
            "find ~/'results dir' -maxdepth 1 -type f -printf '%T@\\t%p\\n' | sort -rn | head -n 2 | cut -f2- | tr '\\n' '\\0' | xargs -0 -r rm -f --"
        );
    }

    #[test]
    fn failed_partial_output_removal_is_not_reported_as_done() {
        let mut h = Harness::new(
            healthy_client().respond(
                "sort -rn",
                FakeResponse::Fail(CommandResult::failed(1, "permission denied")),
            ),
        );
        h.profile.minimum_plausible_duration_secs = 600;
        let outcome = h.run(&mut context("50")).expect("run completes");
        assert!(outcome.discarded);
        assert_eq!(h.count("| head -n 2 |"), 1);
        assert!(!h.sink.has(EventKind::PartialArtifactsRemoved));
    }

    #[test]
    fn deployment_error_output_counts_as_launch_failure() {
        let mut h = Harness::new(healthy_client().respond(
            "up -d",
            FakeResponse::Ok(CommandResult::failed(0, "no such service: tts")),
        ));
        let err = h.run(&mut context("50")).expect_err("run interrupted");
        assert_eq!(err.reason.code(), "deployment_launch_failed");
        assert_eq!(h.count("docker ps"), 0);
    }

    #[test]
    fn lenient_mode_does_not_power_cycle() {
        let mut h = Harness::new(
            FakeSessionClient::new().respond("docker ps", FakeResponse::stdout("40")),
        );
        h.settings.lenient = true;
        let err = h.run(&mut context("75")).expect_err("run interrupted");
        assert_eq!(err.reason.code(), "deployment_not_ready");
        assert_eq!(h.count("reboot"), 0);
        assert!(!h.clock.sleeps().contains(&Duration::from_secs(360)));
        assert!(!h.sink.has(EventKind::RebootRequested));
    }

    #[test]
    fn missing_measurement_artifact_interrupts_before_monitor() {
        let mut h = Harness::new(
            healthy_client().respond("test -e", FakeResponse::Fail(CommandResult::failed(1, ""))),
        );
        let mut ctx = context("50");
        let err = h.run(&mut ctx).expect_err("run interrupted");
        assert_eq!(
            err.reason,
            InterruptReason::MeasurementServiceFailedToStart {
                artifact: "/srv/exp/results/energy/energyGL6.log".to_string()
            }
        );
        assert_eq!(h.count("monitor-er.sh GL6"), 0);
        assert_eq!(h.count("k6 run -"), 0);
        assert_eq!(h.count("kill-session -t measurement"), 1);
        assert_eq!(h.count("[s]tart_Rittal.sh"), 1);
        assert_stop_order(&h);
        assert!(h.sink.has(EventKind::MeasurementFailed));
        assert!(h
            .sink
            .messages()
            .contains(&"RITTAL FAILED: /srv/exp/results/energy/energyGL6.log not found".to_string()));
    }

    #[test]
    fn short_load_step_discards_without_aborting() {
        let mut h = Harness::new(
            FakeSessionClient::new()
                .respond("docker ps", FakeResponse::stdout("70"))
                .takes("k6 run", Duration::from_secs(60)),
        );
        let mut ctx = context("100");
        let outcome = h.run(&mut ctx).expect("short runs still complete");
        assert!(outcome.discarded);
        assert!(outcome
            .discard_reason
            .expect("reason")
            .contains("load step too short"));
        assert_eq!(h.count("stop_Rittal"), 0);
        assert_eq!(h.count("kill-session -t measurement"), 1);
        assert_eq!(h.count("| head -n 2 |"), 1);
        assert_stop_order(&h);
        assert!(h.sink.has(EventKind::LoadTooShort));
        assert!(h.sink.has(EventKind::RunDiscarded));
    }

    #[test]
    fn discard_flag_is_reset_at_the_start_of_each_run() {
        let mut h = Harness::new(healthy_client());
        let mut ctx = context("50");
        ctx.mark_discard("left over from a previous run");
        let outcome = h.run(&mut ctx).expect("run completes");
        assert!(!outcome.discarded);
    }

    #[test]
    fn not_found_cleanup_results_are_tolerated() {
        let mut h = Harness::new(
            healthy_client()
                .respond(
                    "kill-server",
                    FakeResponse::Fail(CommandResult::failed(1, "no server running on /tmp/tmux-0/default")),
                )
                .respond(
                    "kill-session",
                    FakeResponse::Fail(CommandResult::failed(1, "can't find session: monitor")),
                )
                .respond(
                    "pgrep",
                    FakeResponse::Fail(CommandResult::failed(1, "permission denied")),
                ),
        );
        let outcome = h.run(&mut context("50")).expect("cleanup never fails a run");
        assert!(!outcome.discarded);
    }

    #[test]
    fn missing_load_parameter_falls_back_to_plain_commands() {
        let mut h = Harness::new(healthy_client());
        h.profile.load.command = "k6 run - <script.js --duration 20s".to_string();
        let outcome = h.run(&mut context("0")).expect("run completes");
        assert!(!outcome.discarded);
        let lines = h.client.lines();
        assert!(lines.contains(&"cd /home/ander/scripts && ./monitor-er.sh GL6 0".to_string()));
        assert!(lines.contains(
            &"~/scripts/logging/stop_Rittal.sh GL6 /srv/exp/results/energy 0".to_string()
        ));
        assert!(h.sink.has(EventKind::ParameterFallback));
    }

    #[test]
    fn unreachable_logger_aborts_during_before_run() {
        let mut h = Harness::new(healthy_client().respond_on(
            "GL3",
            "kill-server",
            FakeResponse::Connection("no route to host".to_string()),
        ));
        let err = h.run(&mut context("50")).expect_err("run interrupted");
        assert_eq!(
            err.reason,
            InterruptReason::HostUnreachable {
                host: "GL3".to_string(),
                phase: Phase::BeforeRun
            }
        );
        assert_eq!(h.count("up -d"), 0);
        assert_stop_order(&h);
    }

    #[test]
    fn deployment_launch_failure_interrupts() {
        let mut h = Harness::new(healthy_client().respond(
            "up -d",
            FakeResponse::Fail(CommandResult::failed(1, "compose file not found")),
        ));
        let err = h.run(&mut context("50")).expect_err("run interrupted");
        assert_eq!(err.reason.code(), "deployment_launch_failed");
        assert_eq!(h.count("docker ps"), 0);
        assert_eq!(h.count("reboot"), 0);
        assert_stop_order(&h);
    }

    #[test]
    fn lost_load_generator_discards_the_run() {
        let mut h = Harness::new(
            FakeSessionClient::new()
                .respond("docker ps", FakeResponse::stdout("70"))
                .respond("k6 run -", FakeResponse::Timeout),
        );
        let outcome = h.run(&mut context("50")).expect("run completes");
        assert!(outcome.discarded);
        assert!(h.sink.has(EventKind::HostUnreachable));
    }

    #[test]
    fn missing_meter_credentials_interrupt_with_configuration_reason() {
        let mut h = Harness::new(healthy_client());
        h.registry = StaticHostRegistry::new();
        let err = h.run(&mut context("50")).expect_err("run interrupted");
        assert_eq!(err.reason.code(), "configuration_error");
        assert_eq!(h.count("start_Rittal"), 0);
        assert_stop_order(&h);
    }

    #[test]
    fn profile_without_deployment_skips_compose_steps() {
        let mut h = Harness::new(
            FakeSessionClient::new().takes("stress-er.sh", Duration::from_secs(898)),
        );
        h.profile.deployment = None;
        h.profile.tunnel = None;
        h.profile.load.command = "cd ~/scripts && ./stress-er.sh ${WORKLOAD} 898".to_string();
        h.profile.load.process_pattern = None;
        let outcome = h.run(&mut context("50")).expect("run completes");
        assert!(!outcome.discarded);
        assert_eq!(h.count("docker"), 0);
        assert_eq!(h.count("[s]tress-er.sh"), 4);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(12)]);
    }
}
