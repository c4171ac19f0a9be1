use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use sutlab_core::{ensure_dir, ResultsLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExperimentStarted,
    ExperimentCompleted,
    PhaseStarted,
    SessionsCleared,
    TunnelOpened,
    DeploymentLaunched,
    DeploymentLaunchFailed,
    DeploymentReady,
    DeploymentNotReady,
    RebootRequested,
    MeasurementStarted,
    MeasurementFailed,
    MonitorStarted,
    MonitorLaunchFailed,
    ParameterFallback,
    LoadCompleted,
    LoadTooShort,
    LoadFailed,
    HostUnreachable,
    MeasurementStopped,
    PartialArtifactsRemoved,
    RunCompleted,
    RunDiscarded,
    RunInterrupted,
    ArtifactsRetrieved,
    Note,
}

/// One lifecycle transition. Runs are keyed by run id and workload; experiment
/// level events leave both empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub experiment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub kind: EventKind,
    pub ts: String,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl EventRow {
    pub fn new(experiment: &str, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            experiment: experiment.to_string(),
            run_id: None,
            workload: None,
            phase: None,
            kind,
            ts: Utc::now().to_rfc3339(),
            message: message.into(),
            payload: Value::Null,
        }
    }

    /// `[r3] [75] message at <ts>`, the line mirrored into the audit log.
    pub fn audit_line(&self) -> String {
        let mut line = String::new();
        for label in [self.run_id.as_deref(), self.workload.as_deref()]
            .into_iter()
            .flatten()
        {
            line.push_str(&format!("[{}] ", label));
        }
        line.push_str(&format!("{} at {}", self.message, self.ts));
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Discarded,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub experiment: String,
    pub run_id: String,
    pub workload: String,
    pub status: RunStatus,
    /// Only completed runs carry usable measurements.
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discard_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_elapsed_secs: Option<f64>,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifestRecord {
    pub schema_version: String,
    pub experiment: String,
    pub created_at: String,
    pub sut: String,
    pub logger: String,
    pub load_generator: String,
    pub measurement: String,
    pub workloads: Vec<String>,
    pub run_labels: Vec<String>,
    pub total_runs: usize,
    pub testing: bool,
    pub config_digest: String,
}

pub trait EventSink {
    fn write_manifest(&mut self, manifest: &ExperimentManifestRecord) -> Result<()>;
    fn append_event(&mut self, row: &EventRow) -> Result<()>;
    fn append_run_record(&mut self, row: &RunRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes `events.jsonl`, `runs.jsonl` and the manifest under the experiment
/// directory, and mirrors every event as a text line into the audit log.
pub struct JsonlEventSink {
    manifest_path: PathBuf,
    events_writer: BufWriter<File>,
    runs_writer: BufWriter<File>,
    audit_writer: BufWriter<File>,
}

impl JsonlEventSink {
    pub fn new(layout: &ResultsLayout, audit_log: &Path) -> Result<Self> {
        ensure_dir(&layout.experiment_dir)?;
        if let Some(parent) = audit_log.parent() {
            ensure_dir(parent)?;
        }
        Ok(Self {
            manifest_path: layout.manifest.clone(),
            events_writer: open_append(&layout.events)?,
            runs_writer: open_append(&layout.runs)?,
            audit_writer: open_append(audit_log)?,
        })
    }
}

impl EventSink for JsonlEventSink {
    fn write_manifest(&mut self, manifest: &ExperimentManifestRecord) -> Result<()> {
        atomic_write_json_pretty(&self.manifest_path, &serde_json::to_value(manifest)?)
    }

    fn append_event(&mut self, row: &EventRow) -> Result<()> {
        append_row(&mut self.events_writer, row)?;
        self.events_writer.flush()?;
        writeln!(self.audit_writer, "{}", row.audit_line())?;
        // The audit log is read live while an experiment runs.
        self.audit_writer.flush()?;
        Ok(())
    }

    fn append_run_record(&mut self, row: &RunRecord) -> Result<()> {
        append_row(&mut self.runs_writer, row)?;
        self.runs_writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.events_writer.flush()?;
        self.runs_writer.flush()?;
        self.audit_writer.flush()?;
        Ok(())
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct BufferedEventSink {
    pub manifest: Option<ExperimentManifestRecord>,
    pub events: Vec<EventRow>,
    pub runs: Vec<RunRecord>,
}

impl BufferedEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.iter().map(|row| row.kind).collect()
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.events.iter().any(|row| row.kind == kind)
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.iter().map(|row| row.message.clone()).collect()
    }
}

impl EventSink for BufferedEventSink {
    fn write_manifest(&mut self, manifest: &ExperimentManifestRecord) -> Result<()> {
        self.manifest = Some(manifest.clone());
        Ok(())
    }

    fn append_event(&mut self, row: &EventRow) -> Result<()> {
        self.events.push(row.clone());
        Ok(())
    }

    fn append_run_record(&mut self, row: &RunRecord) -> Result<()> {
        self.runs.push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};
    use sutlab_core::results_layout;

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("sutlab_runner_sink_{}_{}", label, nanos))
    }

    #[test]
    fn jsonl_sink_appends_events_runs_and_audit_lines() {
        let root = temp_root("append");
        let layout = results_layout(&root);
        let audit = root.join("logfileGL6.log");
        let mut sink = JsonlEventSink::new(&layout, &audit).expect("sink should initialize");
        sink.write_manifest(&ExperimentManifestRecord {
            schema_version: "experiment_manifest_v1".to_string(),
            experiment: "def-tts-GL6".to_string(),
            created_at: "2026-10-19T00:00:00Z".to_string(),
            sut: "GL6".to_string(),
            logger: "GL3".to_string(),
            load_generator: "GL5".to_string(),
            measurement: "local".to_string(),
            workloads: vec!["50".to_string()],
            run_labels: vec!["r1".to_string()],
            total_runs: 1,
            testing: false,
            config_digest: "sha256:00".to_string(),
        })
        .expect("manifest should write");

        let mut event = EventRow::new("def-tts-GL6", EventKind::MeasurementFailed, "RITTAL FAILED");
        event.run_id = Some("r1".to_string());
        event.workload = Some("50".to_string());
        event.payload = json!({"artifact": "energyGL6.log"});
        sink.append_event(&event).expect("event should append");

        let events = fs::read_to_string(&layout.events).expect("events file");
        let row: Value = serde_json::from_str(events.trim()).expect("event is on disk before flush");
        assert_eq!(row["kind"], "measurement_failed");
        assert_eq!(row["payload"]["artifact"], "energyGL6.log");

        sink.append_run_record(&RunRecord {
            experiment: "def-tts-GL6".to_string(),
            run_id: "r1".to_string(),
            workload: "50".to_string(),
            status: RunStatus::Interrupted,
            valid: false,
            discard_reason: Some("measurement service did not start".to_string()),
            interrupt_reason: Some("measurement_service_failed_to_start".to_string()),
            load_elapsed_secs: None,
            started_at: "2026-10-19T00:00:00Z".to_string(),
            finished_at: "2026-10-19T00:01:00Z".to_string(),
        })
        .expect("run row should append");
        sink.flush().expect("flush");

        let runs = fs::read_to_string(&layout.runs).expect("runs file");
        assert!(runs.contains("\"status\":\"interrupted\""));

        let audit_text = fs::read_to_string(&audit).expect("audit file");
        assert_eq!(
            audit_text.trim_end(),
            format!("[r1] [50] RITTAL FAILED at {}", event.ts)
        );

        let manifest: Value =
            serde_json::from_slice(&fs::read(&layout.manifest).expect("manifest file"))
                .expect("manifest json");
        assert_eq!(manifest["sut"], "GL6");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn experiment_level_audit_lines_have_no_run_label() {
        let mut row = EventRow::new("exp", EventKind::ExperimentStarted, "New experiment started");
        row.ts = "2026-10-19T00:00:00+00:00".to_string();
        assert_eq!(
            row.audit_line(),
            "New experiment started at 2026-10-19T00:00:00+00:00"
        );
    }

    #[test]
    fn buffered_sink_keeps_rows_in_order() {
        let mut sink = BufferedEventSink::new();
        sink.append_event(&EventRow::new("exp", EventKind::RunCompleted, "done"))
            .expect("append");
        sink.append_event(&EventRow::new("exp", EventKind::Note, "note"))
            .expect("append");
        assert_eq!(sink.kinds(), vec![EventKind::RunCompleted, EventKind::Note]);
        assert!(sink.has(EventKind::Note));
        assert_eq!(sink.messages(), vec!["done", "note"]);
    }
}
