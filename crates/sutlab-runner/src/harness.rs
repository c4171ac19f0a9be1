use crate::config::{load_experiment, render_template, LoadedExperiment, RunTable, TransportSettings};
use crate::controller::{ControllerSettings, RunLifecycleController, TUNNEL_SESSION};
use crate::sink::{
    atomic_write_json_pretty, EventKind, EventRow, EventSink, ExperimentManifestRecord,
    JsonlEventSink, RunRecord, RunStatus,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sutlab_core::{
    canonical_json_digest, ensure_dir, results_layout, Clock, ConfigurationError, EnvHostRegistry,
    HostRegistry, HostTarget, ResultsLayout, RunContext, RunHosts, SystemClock,
};
use sutlab_remote::{
    quote_path, run_cleanup, tmux_kill_session, ExecutionMode, RemoteCommand, SessionClient,
    SshSessionClient,
};
use walkdir::WalkDir;

const NETWORK_TUNING_COMMANDS: &[(&str, bool)] = &[
    ("sysctl -w net.ipv4.ip_local_port_range='1024 65535'", true),
    ("sysctl -w net.ipv4.tcp_tw_reuse=1", true),
    ("sysctl -w net.ipv4.tcp_timestamps=1", true),
    ("ulimit -n 250000", false),
];

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forces lenient mode regardless of the experiment file.
    pub testing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightHost {
    pub alias: String,
    pub address: String,
    pub principal: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub hosts: Vec<PreflightHost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub experiment: String,
    pub experiment_file: PathBuf,
    pub experiment_dir: PathBuf,
    pub sut: String,
    pub logger: String,
    pub load_generator: String,
    pub measurement: String,
    pub workloads: Vec<String>,
    pub run_labels: Vec<String>,
    pub total_runs: usize,
    pub time_between_runs_secs: u64,
    pub testing: bool,
    pub deploys_target: bool,
    pub min_component_count: Option<u64>,
    pub tunnel: Option<String>,
    pub load_parameters: BTreeMap<String, String>,
    pub minimum_plausible_duration_secs: u64,
    pub measurement_duration_secs: u64,
    pub config_digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactCounts {
    pub energy: usize,
    pub cpu_mem: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub experiment: String,
    pub experiment_dir: PathBuf,
    pub total_runs: usize,
    pub completed: usize,
    pub discarded: usize,
    pub interrupted: usize,
    pub artifacts: ArtifactCounts,
    pub runs: Vec<RunRecord>,
}

/// Resolves every remote host and the meter login. Issues no commands.
pub fn preflight_hosts(
    loaded: &LoadedExperiment,
    registry: &dyn HostRegistry,
) -> std::result::Result<PreflightReport, ConfigurationError> {
    let hosts = loaded.config.hosts.run_hosts();
    let mut resolved = Vec::new();
    for host in hosts.remote() {
        let entry = registry.resolve(host.alias())?;
        resolved.push(PreflightHost {
            alias: host.alias().to_string(),
            address: entry.address,
            principal: entry.principal,
        });
    }
    let meter_credential = match loaded.config.profile.measurement.credential_alias.as_deref() {
        Some(alias) => {
            registry.resolve_login(alias)?;
            Some(alias.to_string())
        }
        None => None,
    };
    Ok(PreflightReport {
        hosts: resolved,
        meter_credential,
    })
}

pub fn preflight_experiment(path: &Path) -> Result<PreflightReport> {
    let loaded = load_experiment(path)?;
    preflight_hosts(&loaded, &EnvHostRegistry::new())
        .map_err(|e| anyhow!("preflight_failed: {}", e))
}

pub fn describe_experiment(path: &Path) -> Result<ExperimentSummary> {
    let loaded = load_experiment(path)?;
    summarize(&loaded)
}

fn summarize(loaded: &LoadedExperiment) -> Result<ExperimentSummary> {
    let config = &loaded.config;
    let table = loaded.run_table()?;
    let hosts = config.hosts.run_hosts();
    Ok(ExperimentSummary {
        experiment: config.experiment.name.clone(),
        experiment_file: loaded.path.clone(),
        experiment_dir: loaded.results_root(),
        sut: hosts.sut.to_string(),
        logger: hosts.logger.to_string(),
        load_generator: hosts.load_generator.to_string(),
        measurement: hosts.measurement.to_string(),
        workloads: config.design.workloads.iter().map(|w| w.to_string()).collect(),
        run_labels: run_labels(&table),
        total_runs: table.len(),
        time_between_runs_secs: config.experiment.time_between_runs_secs,
        testing: config.experiment.testing,
        deploys_target: config.profile.deploys_target(),
        min_component_count: config
            .profile
            .deployment
            .as_ref()
            .map(|d| d.min_component_count),
        tunnel: config
            .profile
            .tunnel
            .as_ref()
            .map(|t| format!("{}:{} via {}", t.local_port, t.target, hosts.logger)),
        load_parameters: config.profile.load_parameters.clone(),
        minimum_plausible_duration_secs: config.profile.minimum_plausible_duration_secs,
        measurement_duration_secs: config.profile.measurement.duration_secs,
        config_digest: canonical_json_digest(&loaded.raw),
    })
}

fn run_labels(table: &RunTable) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for row in &table.rows {
        if !labels.contains(&row.run_id) {
            labels.push(row.run_id.clone());
        }
    }
    labels
}

/// Loads the experiment, checks credentials and drives every run against the
/// real hosts.
pub fn run_experiment(path: &Path, options: &RunOptions) -> Result<ExperimentReport> {
    let mut loaded = load_experiment(path)?;
    if options.testing {
        loaded.config.experiment.testing = true;
    }
    let registry: Arc<dyn HostRegistry> = Arc::new(EnvHostRegistry::new());
    preflight_hosts(&loaded, registry.as_ref()).map_err(|e| anyhow!("preflight_failed: {}", e))?;

    let transport = TransportSettings::from_env()?;
    let client = SshSessionClient::new(registry.clone(), transport.ssh);
    let layout = results_layout(&loaded.results_root());
    let audit_log = layout.experiment_dir.join(loaded.audit_log_name());
    let mut sink = JsonlEventSink::new(&layout, &audit_log)?;
    let clock = SystemClock;
    let mut runner = ExperimentRunner::new(&loaded, &client, registry.as_ref(), &clock, &mut sink);
    runner.execute()
}

/// The experiment-level phases around the per-run controller.
pub struct ExperimentRunner<'a> {
    loaded: &'a LoadedExperiment,
    client: &'a dyn SessionClient,
    registry: &'a dyn HostRegistry,
    clock: &'a dyn Clock,
    sink: &'a mut dyn EventSink,
    layout: ResultsLayout,
    hosts: RunHosts,
    settings: ControllerSettings,
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(
        loaded: &'a LoadedExperiment,
        client: &'a dyn SessionClient,
        registry: &'a dyn HostRegistry,
        clock: &'a dyn Clock,
        sink: &'a mut dyn EventSink,
    ) -> Self {
        let layout = results_layout(&loaded.results_root());
        let settings = ControllerSettings {
            experiment: loaded.config.experiment.name.clone(),
            lenient: loaded.config.experiment.testing,
            energy_dir: layout.energy_dir.clone(),
            results_dir: layout.results_dir.clone(),
        };
        Self {
            loaded,
            client,
            registry,
            clock,
            sink,
            hosts: loaded.config.hosts.run_hosts(),
            layout,
            settings,
        }
    }

    pub fn layout(&self) -> &ResultsLayout {
        &self.layout
    }

    pub fn execute(&mut self) -> Result<ExperimentReport> {
        preflight_hosts(self.loaded, self.registry)
            .map_err(|e| anyhow!("preflight_failed: {}", e))?;
        let table = self.loaded.run_table()?;
        self.before_experiment(&table)?;
        let runs = self.run_all(&table);
        let artifacts = self.after_experiment()?;

        let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
        Ok(ExperimentReport {
            experiment: self.settings.experiment.clone(),
            experiment_dir: self.layout.experiment_dir.clone(),
            total_runs: table.len(),
            completed: count(RunStatus::Completed),
            discarded: count(RunStatus::Discarded),
            interrupted: count(RunStatus::Interrupted),
            artifacts,
            runs,
        })
    }

    pub fn before_experiment(&mut self, table: &RunTable) -> Result<()> {
        ensure_dir(&self.layout.energy_dir)?;
        atomic_write_json_pretty(&self.layout.resolved_experiment, &self.loaded.raw)?;
        let config = &self.loaded.config;
        self.sink.write_manifest(&ExperimentManifestRecord {
            schema_version: "experiment_manifest_v1".to_string(),
            experiment: config.experiment.name.clone(),
            created_at: Utc::now().to_rfc3339(),
            sut: self.hosts.sut.to_string(),
            logger: self.hosts.logger.to_string(),
            load_generator: self.hosts.load_generator.to_string(),
            measurement: self.hosts.measurement.to_string(),
            workloads: config.design.workloads.iter().map(|w| w.to_string()).collect(),
            run_labels: run_labels(table),
            total_runs: table.len(),
            testing: config.experiment.testing,
            config_digest: canonical_json_digest(&self.loaded.raw),
        })?;

        let generator = self.hosts.load_generator.clone();
        if config.profile.network_tuning && !generator.is_local() {
            self.tune_network(&generator);
        }
        self.note(
            EventKind::ExperimentStarted,
            "New experiment started from scratch",
            json!({ "total_runs": table.len() }),
        );
        Ok(())
    }

    fn tune_network(&mut self, host: &HostTarget) {
        for (line, privileged) in NETWORK_TUNING_COMMANDS {
            let mut command = RemoteCommand::new(*line);
            if *privileged {
                command = command.privileged();
            }
            if let Err(err) = self
                .client
                .execute(host, &command, &ExecutionMode::Foreground)
            {
                tracing::warn!(host = %host, command = *line, error = %err, "network tuning failed");
            }
        }
    }

    /// Every row of the run table in order. An interrupted run is recorded and
    /// the next one starts after the cool-down.
    pub fn run_all(&mut self, table: &RunTable) -> Vec<RunRecord> {
        let cooldown = Duration::from_secs(self.loaded.config.experiment.time_between_runs_secs);
        let mut records = Vec::with_capacity(table.len());
        for (idx, row) in table.rows.iter().enumerate() {
            let mut ctx = RunContext::new(&row.run_id, row.workload.clone(), self.hosts.clone());
            let started_at = Utc::now().to_rfc3339();
            tracing::info!(
                run_id = %row.run_id,
                workload = %row.workload,
                "starting run {}/{}",
                idx + 1,
                table.len()
            );
            let result = RunLifecycleController::new(
                self.client,
                self.registry,
                self.clock,
                &self.loaded.config.profile,
                &self.settings,
                &mut *self.sink,
            )
            .run(&mut ctx);

            let (status, interrupt_reason) = match result {
                Ok(outcome) if outcome.discarded => (RunStatus::Discarded, None),
                Ok(_) => (RunStatus::Completed, None),
                Err(interrupted) => {
                    tracing::warn!(error = %interrupted, "run interrupted");
                    (
                        RunStatus::Interrupted,
                        Some(interrupted.reason.code().to_string()),
                    )
                }
            };
            let record = RunRecord {
                experiment: self.settings.experiment.clone(),
                run_id: row.run_id.clone(),
                workload: row.workload.to_string(),
                status,
                valid: status == RunStatus::Completed,
                discard_reason: ctx.discard_reason().map(str::to_string),
                interrupt_reason,
                load_elapsed_secs: ctx.load_elapsed().map(|d| d.as_secs_f64()),
                started_at,
                finished_at: Utc::now().to_rfc3339(),
            };
            if let Err(err) = self.sink.append_run_record(&record) {
                tracing::warn!(error = %err, "failed to record run");
            }
            records.push(record);

            if idx + 1 < table.len() && !cooldown.is_zero() {
                tracing::info!("cooling down for {}s", cooldown.as_secs());
                self.clock.sleep(cooldown);
            }
        }
        records
    }

    /// Retrieves the monitor output and closes what the runs left open.
    pub fn after_experiment(&mut self) -> Result<ArtifactCounts> {
        ensure_dir(&self.layout.cpu_mem_dir)?;
        let config = &self.loaded.config;
        let sut = self.hosts.sut.clone();
        let output_dir = config.profile.monitor.output_dir.clone();

        let remote_glob = format!("{}/*", output_dir.trim_end_matches('/'));
        if let Err(err) = self.client.fetch(&sut, &remote_glob, &self.layout.cpu_mem_dir) {
            tracing::warn!(host = %sut, error = %err, "failed to retrieve monitor output");
        }
        if config.experiment.testing {
            let line = format!("rm -rf -- {}/*", quote_path(output_dir.trim_end_matches('/')));
            run_cleanup(self.client, &sut, &RemoteCommand::new(line), "remote monitor output");
        }

        if let Some(raw) = config.experiment.analysis_command.as_deref() {
            let mut vars = BTreeMap::new();
            vars.insert("SUT", sut.alias().to_string());
            vars.insert("RESULTS_DIR", self.layout.results_dir.display().to_string());
            vars.insert("ENERGY_DIR", self.layout.energy_dir.display().to_string());
            let command = RemoteCommand::new(render_template(raw, &vars));
            if let Err(err) =
                self.client
                    .execute(&HostTarget::local(), &command, &ExecutionMode::Foreground)
            {
                tracing::warn!(error = %err, "analysis command failed");
            }
        }

        if config.profile.tunnel.is_some() {
            run_cleanup(
                self.client,
                &HostTarget::local(),
                &RemoteCommand::new(tmux_kill_session(TUNNEL_SESSION)),
                "tunnel session",
            );
        }

        let artifacts = ArtifactCounts {
            energy: count_files(&self.layout.energy_dir),
            cpu_mem: count_files(&self.layout.cpu_mem_dir),
        };
        self.note(
            EventKind::ArtifactsRetrieved,
            format!(
                "{} energy and {} cpu/mem files in {}",
                artifacts.energy,
                artifacts.cpu_mem,
                self.layout.results_dir.display()
            ),
            serde_json::to_value(&artifacts).unwrap_or(Value::Null),
        );
        self.note(EventKind::ExperimentCompleted, "Experiment completed", Value::Null);
        self.sink.flush()?;
        Ok(artifacts)
    }

    fn note(&mut self, kind: EventKind, message: impl Into<String>, payload: Value) {
        let mut row = EventRow::new(&self.settings.experiment, kind, message);
        row.payload = payload;
        if let Err(err) = self.sink.append_event(&row) {
            tracing::warn!(error = %err, "failed to record event");
        }
    }
}

fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}
