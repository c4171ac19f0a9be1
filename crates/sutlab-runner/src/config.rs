use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sutlab_core::{HostTarget, RunHosts, Workload};
use sutlab_remote::SshSettings;

pub const SUTLAB_TESTING_ENV: &str = "SUTLAB_TESTING";
pub const SUTLAB_TIME_BETWEEN_RUNS_SECS_ENV: &str = "SUTLAB_TIME_BETWEEN_RUNS_SECS";
pub const SUTLAB_COMMAND_TIMEOUT_SECS_ENV: &str = "SUTLAB_COMMAND_TIMEOUT_SECS";
pub const SUTLAB_SSH_CONNECT_TIMEOUT_SECS_ENV: &str = "SUTLAB_SSH_CONNECT_TIMEOUT_SECS";

pub(crate) const PARAM_PLACEHOLDER: &str = "${PARAM}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,
    pub design: DesignSection,
    pub hosts: HostsSection,
    pub profile: WorkloadProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub name: String,
    /// Relative paths resolve against the experiment file's directory.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    #[serde(default = "default_time_between_runs_secs")]
    pub time_between_runs_secs: u64,
    /// Lenient mode: no SUT power-cycle on deployment failure, remote monitor
    /// output is removed after retrieval.
    #[serde(default)]
    pub testing: bool,
    #[serde(default)]
    pub audit_log: Option<String>,
    /// Run locally after the monitor output has been retrieved.
    #[serde(default)]
    pub analysis_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesignSection {
    #[serde(default)]
    pub runs: Vec<String>,
    #[serde(default)]
    pub repetitions: Option<usize>,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsSection {
    pub sut: String,
    pub logger: String,
    #[serde(default)]
    pub load_generator: Option<String>,
    #[serde(default)]
    pub measurement: Option<String>,
}

impl HostsSection {
    pub fn run_hosts(&self) -> RunHosts {
        RunHosts {
            sut: HostTarget::new(&self.sut),
            logger: HostTarget::new(&self.logger),
            load_generator: self
                .load_generator
                .as_deref()
                .map(HostTarget::new)
                .unwrap_or_else(HostTarget::local),
            measurement: self
                .measurement
                .as_deref()
                .map(HostTarget::new)
                .unwrap_or_else(HostTarget::local),
        }
    }
}

/// Everything that differs between experiment variants: which commands run,
/// how long to wait and what counts as ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadProfile {
    /// Workload level to derived load parameter (e.g. virtual users).
    #[serde(default)]
    pub load_parameters: BTreeMap<String, String>,
    #[serde(default = "default_minimum_plausible_duration_secs")]
    pub minimum_plausible_duration_secs: u64,
    #[serde(default)]
    pub tunnel: Option<TunnelProfile>,
    #[serde(default)]
    pub deployment: Option<DeploymentProfile>,
    pub measurement: MeasurementProfile,
    pub monitor: MonitorProfile,
    pub load: LoadProfile,
    /// Apply kernel network tuning on a remote load generator before the
    /// experiment.
    #[serde(default)]
    pub network_tuning: bool,
}

impl WorkloadProfile {
    pub fn load_parameter(&self, workload: &Workload) -> Option<&str> {
        self.load_parameters
            .get(workload.as_str())
            .map(String::as_str)
    }

    pub fn minimum_plausible_duration(&self) -> Duration {
        Duration::from_secs(self.minimum_plausible_duration_secs)
    }

    pub fn deploys_target(&self) -> bool {
        self.deployment.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelProfile {
    #[serde(default = "default_tunnel_local_port")]
    pub local_port: u16,
    /// `address:port` reachable from the logging host.
    pub target: String,
    #[serde(default = "default_tunnel_settle_secs")]
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentProfile {
    /// Directory the up and down commands run from. Entered as the login
    /// user, so `~` is not root's home under sudo.
    #[serde(default)]
    pub workdir: Option<String>,
    pub up_command: String,
    pub down_command: String,
    /// Prints a single integer; compared against `min_component_count`.
    #[serde(default = "default_count_command")]
    pub count_command: String,
    pub min_component_count: u64,
    #[serde(default = "default_deployment_wait_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_deployment_wait_secs")]
    pub escalation_secs: u64,
    #[serde(default = "default_deployment_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reboot_settle_secs")]
    pub reboot_settle_secs: u64,
    #[serde(default = "default_runtime_restart_command")]
    pub runtime_restart_command: String,
    #[serde(default)]
    pub prune_command: Option<String>,
    /// Run the compose, runtime and prune commands under sudo.
    #[serde(default = "default_true")]
    pub privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementProfile {
    pub start_command: String,
    pub stop_command: String,
    /// File the logging service creates once it is recording.
    pub artifact: String,
    #[serde(default = "default_measurement_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_measurement_settle_secs")]
    pub settle_secs: u64,
    /// Alias whose `_U`/`_P` variables hold the meter login.
    #[serde(default)]
    pub credential_alias: Option<String>,
    #[serde(default)]
    pub process_pattern: Option<String>,
}

impl MeasurementProfile {
    pub fn process_pattern(&self) -> String {
        self.process_pattern
            .clone()
            .unwrap_or_else(|| script_name(&self.start_command))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorProfile {
    pub command: String,
    #[serde(default = "default_monitor_pattern")]
    pub process_pattern: String,
    /// Directory on the SUT the monitor writes its cpu/mem files to.
    pub output_dir: String,
    #[serde(default = "default_partial_artifacts")]
    pub partial_artifacts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadProfile {
    pub command: String,
    #[serde(default = "default_load_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub process_pattern: Option<String>,
}

impl LoadProfile {
    pub fn process_pattern(&self) -> String {
        self.process_pattern
            .clone()
            .unwrap_or_else(|| script_name(&self.command))
    }
}

fn default_true() -> bool {
    true
}

fn default_results_dir() -> String {
    "experiments".to_string()
}

fn default_time_between_runs_secs() -> u64 {
    300
}

fn default_minimum_plausible_duration_secs() -> u64 {
    120
}

fn default_tunnel_local_port() -> u16 {
    8080
}

fn default_tunnel_settle_secs() -> u64 {
    3
}

fn default_count_command() -> String {
    "docker ps | wc -l".to_string()
}

fn default_deployment_wait_secs() -> u64 {
    180
}

fn default_deployment_max_attempts() -> u32 {
    2
}

fn default_reboot_settle_secs() -> u64 {
    360
}

fn default_runtime_restart_command() -> String {
    "systemctl stop docker && systemctl start docker".to_string()
}

fn default_measurement_duration_secs() -> u64 {
    900
}

fn default_measurement_settle_secs() -> u64 {
    12
}

fn default_monitor_pattern() -> String {
    "monitor-er.sh".to_string()
}

fn default_partial_artifacts() -> usize {
    2
}

fn default_load_timeout_secs() -> u64 {
    1800
}

/// File name of the first token that looks like a script, used as the
/// `pgrep -f` pattern when none is configured.
fn script_name(command: &str) -> String {
    let token = command
        .split(|c: char| c.is_whitespace() || c == ';' || c == '&')
        .find(|t| t.ends_with(".sh") || t.ends_with(".js") || t.ends_with(".py"))
        .or_else(|| command.split_whitespace().next())
        .unwrap_or(command);
    Path::new(token)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| token.to_string())
}

/// Replaces `${KEY}` occurrences with the given values. Unknown placeholders
/// are left untouched.
pub fn render_template(raw: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut rendered = raw.to_string();
    for (key, value) in vars {
        let needle = format!("${{{}}}", key);
        if rendered.contains(&needle) {
            rendered = rendered.replace(&needle, value);
        }
    }
    rendered
}

/// Settings of the ssh transport, after environment overrides.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ssh: SshSettings,
}

impl TransportSettings {
    pub fn from_env() -> Result<Self> {
        let mut ssh = SshSettings::default();
        if let Some(secs) = parse_optional_u64_env(SUTLAB_COMMAND_TIMEOUT_SECS_ENV, false)? {
            ssh.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_optional_u64_env(SUTLAB_SSH_CONNECT_TIMEOUT_SECS_ENV, false)? {
            ssh.connect_timeout = Duration::from_secs(secs);
        }
        Ok(Self { ssh })
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub workload: Workload,
}

/// The run-variation matrix: every run label crossed with every workload,
/// run-major.
#[derive(Debug, Clone)]
pub struct RunTable {
    pub rows: Vec<RunRow>,
}

impl RunTable {
    pub fn from_design(design: &DesignSection) -> Result<Self> {
        let runs = design_run_labels(design)?;
        let mut rows = Vec::with_capacity(runs.len() * design.workloads.len());
        for run_id in &runs {
            for workload in &design.workloads {
                rows.push(RunRow {
                    run_id: run_id.clone(),
                    workload: workload.clone(),
                });
            }
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn design_run_labels(design: &DesignSection) -> Result<Vec<String>> {
    match (design.runs.is_empty(), design.repetitions) {
        (false, None) => Ok(design.runs.clone()),
        (true, Some(n)) if n > 0 => Ok((1..=n).map(|i| format!("r{}", i)).collect()),
        (true, Some(_)) => Err(anyhow!("invalid_design: /design/repetitions must be > 0")),
        (false, Some(_)) => Err(anyhow!(
            "invalid_design: set either /design/runs or /design/repetitions, not both"
        )),
        (true, None) => Err(anyhow!(
            "invalid_design: /design/runs or /design/repetitions is required"
        )),
    }
}

/// A parsed experiment file plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedExperiment {
    pub path: PathBuf,
    pub base_dir: PathBuf,
    pub config: ExperimentConfig,
    /// The file as JSON, for the resolved copy and its digest.
    pub raw: Value,
}

impl LoadedExperiment {
    pub fn results_root(&self) -> PathBuf {
        let configured = Path::new(&self.config.experiment.results_dir);
        let root = if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.base_dir.join(configured)
        };
        root.join(&self.config.experiment.name)
    }

    pub fn run_table(&self) -> Result<RunTable> {
        RunTable::from_design(&self.config.design)
    }

    pub fn audit_log_name(&self) -> String {
        self.config
            .experiment
            .audit_log
            .clone()
            .unwrap_or_else(|| format!("logfile{}.log", self.config.hosts.sut))
    }
}

pub fn load_experiment(path: &Path) -> Result<LoadedExperiment> {
    let raw_yaml = fs::read_to_string(path)
        .map_err(|e| anyhow!("experiment_unreadable: {}: {}", path.display(), e))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let raw: Value = serde_json::to_value(yaml_value)?;
    let mut config: ExperimentConfig = serde_json::from_value(raw.clone())
        .map_err(|e| anyhow!("invalid_experiment: {}: {}", path.display(), e))?;
    apply_env_overrides(&mut config)?;
    validate_experiment(&config)?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = base_dir.canonicalize().unwrap_or(base_dir);
    Ok(LoadedExperiment {
        path: path.to_path_buf(),
        base_dir,
        config,
        raw,
    })
}

pub fn apply_env_overrides(config: &mut ExperimentConfig) -> Result<()> {
    if let Some(testing) = parse_optional_bool_env(SUTLAB_TESTING_ENV)? {
        config.experiment.testing = testing;
    }
    if let Some(secs) = parse_optional_u64_env(SUTLAB_TIME_BETWEEN_RUNS_SECS_ENV, true)? {
        config.experiment.time_between_runs_secs = secs;
    }
    Ok(())
}

pub fn validate_experiment(config: &ExperimentConfig) -> Result<()> {
    let mut missing = Vec::new();
    let required: [(&str, &str); 9] = [
        ("/experiment/name", config.experiment.name.as_str()),
        ("/hosts/sut", config.hosts.sut.as_str()),
        ("/hosts/logger", config.hosts.logger.as_str()),
        (
            "/profile/measurement/start_command",
            config.profile.measurement.start_command.as_str(),
        ),
        (
            "/profile/measurement/stop_command",
            config.profile.measurement.stop_command.as_str(),
        ),
        (
            "/profile/measurement/artifact",
            config.profile.measurement.artifact.as_str(),
        ),
        ("/profile/monitor/command", config.profile.monitor.command.as_str()),
        (
            "/profile/monitor/output_dir",
            config.profile.monitor.output_dir.as_str(),
        ),
        ("/profile/load/command", config.profile.load.command.as_str()),
    ];
    for (pointer, value) in required {
        if value.trim().is_empty() {
            missing.push(pointer);
        }
    }
    if !missing.is_empty() {
        return Err(anyhow!(
            "invalid_experiment: missing required fields: {}",
            missing.join(", ")
        ));
    }

    if config.design.workloads.is_empty() {
        return Err(anyhow!("invalid_design: /design/workloads must not be empty"));
    }
    let labels = design_run_labels(&config.design)?;
    let mut seen = BTreeSet::new();
    for label in &labels {
        if !seen.insert(label.as_str()) {
            return Err(anyhow!("invalid_design: duplicate run label '{}'", label));
        }
    }

    if let Some(deployment) = config.profile.deployment.as_ref() {
        if deployment.max_attempts == 0 {
            return Err(anyhow!(
                "invalid_experiment: /profile/deployment/max_attempts must be > 0"
            ));
        }
        if deployment.up_command.trim().is_empty() || deployment.down_command.trim().is_empty() {
            return Err(anyhow!(
                "invalid_experiment: deployment up_command and down_command are required"
            ));
        }
    }

    // The load step has no fallback form, so every workload needs its parameter.
    if config.profile.load.command.contains(PARAM_PLACEHOLDER) {
        let unmapped: Vec<&str> = config
            .design
            .workloads
            .iter()
            .filter(|w| config.profile.load_parameter(w).is_none())
            .map(Workload::as_str)
            .collect();
        if !unmapped.is_empty() {
            return Err(anyhow!(
                "invalid_experiment: /profile/load/command uses ${{PARAM}} but /profile/load_parameters has no entry for workloads: {}",
                unmapped.join(", ")
            ));
        }
    }
    Ok(())
}

fn parse_optional_u64_env(name: &str, allow_zero: bool) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a non-negative integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 && !allow_zero {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_optional_bool_env(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(anyhow!("{} must be a boolean when set (got: {})", name, raw)),
        },
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}
