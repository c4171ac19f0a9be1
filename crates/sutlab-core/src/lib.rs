use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub mod clock;
pub mod context;
pub mod error;
pub mod hosts;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{RunContext, RunHosts, Workload};
pub use error::ConfigurationError;
pub use hosts::{
    EnvHostRegistry, HostRegistry, HostTarget, LoginCredentials, ResolvedHost, Secret,
    StaticHostRegistry, LOCAL_HOST_ALIAS,
};

pub const RESULTS_ENERGY_DIR: &str = "energy";
pub const RESULTS_CPU_MEM_DIR: &str = "cpu_mem";

pub const EVENTS_FILE: &str = "events.jsonl";
pub const RUNS_FILE: &str = "runs.jsonl";
pub const EXPERIMENT_MANIFEST_FILE: &str = "experiment_manifest.json";
pub const RESOLVED_EXPERIMENT_FILE: &str = "resolved_experiment.json";

/// On-disk layout of one experiment. Artifacts from the power meter and the
/// host-side resource monitor are kept in separate partitions.
#[derive(Debug, Clone)]
pub struct ResultsLayout {
    pub experiment_dir: PathBuf,
    pub results_dir: PathBuf,
    pub energy_dir: PathBuf,
    pub cpu_mem_dir: PathBuf,
    pub events: PathBuf,
    pub runs: PathBuf,
    pub manifest: PathBuf,
    pub resolved_experiment: PathBuf,
}

pub fn results_layout(experiment_dir: &Path) -> ResultsLayout {
    let results_dir = experiment_dir.join("results");
    ResultsLayout {
        experiment_dir: experiment_dir.to_path_buf(),
        energy_dir: results_dir.join(RESULTS_ENERGY_DIR),
        cpu_mem_dir: results_dir.join(RESULTS_CPU_MEM_DIR),
        results_dir,
        events: experiment_dir.join(EVENTS_FILE),
        runs: experiment_dir.join(RUNS_FILE),
        manifest: experiment_dir.join(EXPERIMENT_MANIFEST_FILE),
        resolved_experiment: experiment_dir.join(RESOLVED_EXPERIMENT_FILE),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Serializes with object keys sorted so that equal configurations hash equally
/// regardless of the key order in the source file.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| {
                    let key = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", key, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"hosts": {"sut": "GL6", "logger": "GL3"}, "runs": ["r1", "r2"]});
        let b = json!({"runs": ["r1", "r2"], "hosts": {"logger": "GL3", "sut": "GL6"}});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn canonical_digest_keeps_array_order() {
        let a = json!({"workloads": ["50", "75"]});
        let b = json!({"workloads": ["75", "50"]});
        assert_ne!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn results_layout_separates_energy_and_monitor_partitions() {
        let layout = results_layout(Path::new("/tmp/exp"));
        assert_eq!(layout.energy_dir, PathBuf::from("/tmp/exp/results/energy"));
        assert_eq!(layout.cpu_mem_dir, PathBuf::from("/tmp/exp/results/cpu_mem"));
        assert_eq!(layout.events, PathBuf::from("/tmp/exp/events.jsonl"));
    }
}
