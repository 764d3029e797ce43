//! Append-only JSONL audit trail of task state transitions.
//!
//! One file per session (`_project.jsonl` when no session id is known) in the
//! per-user project store. Writers only append; readers scan forward.

use crate::check::verdict::VerdictKind;
use crate::check::CheckOutcome;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_store::ProjectStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Running,
    Pass,
    Fail,
    Skip,
    /// Configuration error.
    Boom,
    /// The arbiter ruled on an appeal.
    Appeal,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
            Self::Boom => "BOOM",
            Self::Appeal => "APPEAL",
        }
    }
}

impl From<VerdictKind> for Status {
    fn from(kind: VerdictKind) -> Self {
        match kind {
            VerdictKind::Pass => Self::Pass,
            VerdictKind::Fail => Self::Fail,
            VerdictKind::Skip => Self::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub ts: String,
    pub seq: u32,
    pub event: String,
    pub task: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ── EventLogger ──

/// Append-only JSONL writer for one gate invocation.
pub struct EventLogger {
    jsonl_path: PathBuf,
    event: String,
    seq: u32,
}

impl EventLogger {
    pub fn new(store: &ProjectStore, session_id: Option<&str>, event: &str) -> Self {
        Self {
            jsonl_path: store.log_path(session_id),
            event: event.to_string(),
            seq: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.jsonl_path
    }

    /// Record a transition. Best-effort: write failures are logged and dropped.
    pub fn record(&mut self, task: &str, status: Status, reason: Option<&str>, duration: Option<Duration>) {
        let entry = LogEntry {
            ts: crate::event::now_rfc3339(),
            seq: self.seq,
            event: self.event.clone(),
            task: task.to_string(),
            status,
            reason: reason.filter(|r| !r.is_empty()).map(String::from),
            duration_ms: duration.map(|d| d.as_millis() as u64),
        };
        self.seq += 1;

        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = append_line(&self.jsonl_path, &line) {
                    tracing::warn!(path = %self.jsonl_path.display(), error = %e, "event log write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "event log entry not serializable"),
        }
    }

    pub fn running(&mut self, task: &str) {
        self.record(task, Status::Running, None, None);
    }

    pub fn outcome(&mut self, task: &str, outcome: &CheckOutcome) {
        self.record(
            task,
            outcome.kind.into(),
            Some(&outcome.reason),
            Some(outcome.duration),
        );
    }
}

/// Append a single line to a file, creating parent dirs if needed.
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Read every parseable entry. Torn or foreign lines are skipped.
pub fn read_entries(path: &Path) -> Vec<LogEntry> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Latest terminal entry per task (RUNNING entries are ignored).
pub fn last_results(entries: &[LogEntry]) -> std::collections::BTreeMap<String, LogEntry> {
    let mut out = std::collections::BTreeMap::new();
    for e in entries {
        if e.status != Status::Running {
            out.insert(e.task.clone(), e.clone());
        }
    }
    out
}
