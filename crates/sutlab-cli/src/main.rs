use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sutlab_runner::{ExperimentReport, ExperimentSummary, PreflightReport, RunOptions};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SUTLAB_LOG";

#[derive(Parser)]
#[command(
    name = "sutlab",
    version = "0.3.0",
    about = "Energy experiment runner for remote systems under test"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every variation of an experiment against the configured hosts.
    Run {
        experiment: PathBuf,
        /// Lenient mode: never power-cycle the SUT, clear remote monitor output afterwards.
        #[arg(long)]
        testing: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the run table, hosts and profile of an experiment.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Resolve every host and credential without contacting any host.
    Preflight {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Diagnostics go to stderr so `--json` output stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            testing,
            json,
        } => {
            let options = RunOptions { testing };
            let summary = run_summary(&experiment, &options)?;
            let report = sutlab_runner::run_experiment(&experiment, &options)?;
            tracing::info!(
                completed = report.completed,
                discarded = report.discarded,
                interrupted = report.interrupted,
                "experiment finished"
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": serde_json::to_value(&summary)?,
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_summary(&summary);
            print_report(&report);
        }
        Commands::Describe { experiment, json } => {
            let summary = sutlab_runner::describe_experiment(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            print_summary(&summary);
        }
        Commands::Preflight { experiment, json } => {
            let report = sutlab_runner::preflight_experiment(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "preflight",
                    "preflight": serde_json::to_value(&report)?,
                })));
            }
            print_preflight_report(&report);
        }
    }
    Ok(None)
}

/// The summary as the run will see it, with command-line overrides applied.
fn run_summary(experiment: &Path, options: &RunOptions) -> Result<ExperimentSummary> {
    let mut summary = sutlab_runner::describe_experiment(experiment)?;
    if options.testing {
        summary.testing = true;
    }
    Ok(summary)
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.experiment);
    println!("experiment_dir: {}", summary.experiment_dir.display());
    println!(
        "hosts: sut={} logger={} load_generator={} measurement={}",
        summary.sut, summary.logger, summary.load_generator, summary.measurement
    );
    println!("workloads: {}", summary.workloads.join(", "));
    println!("runs: {}", summary.run_labels.join(", "));
    println!("total_runs: {}", summary.total_runs);
    println!("time_between_runs: {}s", summary.time_between_runs_secs);
    println!("measurement_duration: {}s", summary.measurement_duration_secs);
    println!(
        "minimum_plausible_duration: {}s",
        summary.minimum_plausible_duration_secs
    );
    if let Some(count) = summary.min_component_count {
        println!("deployment: min {} components", count);
    }
    if let Some(tunnel) = &summary.tunnel {
        println!("tunnel: {}", tunnel);
    }
    if !summary.load_parameters.is_empty() {
        let params: Vec<String> = summary
            .load_parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("load_parameters: {}", params.join(" "));
    }
    if summary.testing {
        println!("mode: testing");
    }
    println!("config_digest: {}", summary.config_digest);
}

fn print_report(report: &ExperimentReport) {
    for run in &report.runs {
        let detail = run
            .interrupt_reason
            .as_deref()
            .or(run.discard_reason.as_deref())
            .unwrap_or("");
        println!(
            "[{}] [{}] {:?} {}",
            run.run_id, run.workload, run.status, detail
        );
    }
    println!(
        "completed: {}  discarded: {}  interrupted: {}  (of {})",
        report.completed, report.discarded, report.interrupted, report.total_runs
    );
    println!(
        "artifacts: energy={} cpu_mem={}",
        report.artifacts.energy, report.artifacts.cpu_mem
    );
}

fn print_preflight_report(report: &PreflightReport) {
    for host in &report.hosts {
        println!("[PASS] {}: {}@{}", host.alias, host.principal, host.address);
    }
    if let Some(alias) = &report.meter_credential {
        println!("[PASS] meter login: {}", alias);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

/// Errors raised as `code: detail` keep their code in JSON mode.
fn error_code(err: &anyhow::Error) -> &'static str {
    let text = err.to_string();
    for code in [
        "preflight_failed",
        "invalid_experiment",
        "invalid_design",
        "experiment_unreadable",
    ] {
        if text.starts_with(code) {
            return code;
        }
    }
    "command_failed"
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Preflight { json, .. } => *json,
    }
}
