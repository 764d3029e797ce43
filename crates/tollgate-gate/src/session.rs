//! Per-session state: failure counters, suspensions, turn activity and signals.
//!
//! Persistence is best-effort. A missing or corrupt file reads as a fresh
//! session and a failed save is logged, never propagated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tollgate_store::ProjectStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub successive_failures: BTreeMap<String, u32>,
    /// Tasks the appeal arbiter excused for the rest of the session.
    #[serde(default)]
    pub suspended: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    /// Tools used since the last user prompt.
    #[serde(default)]
    pub turn_tools: Vec<String>,
    /// Lines written by edit tools over the whole session.
    #[serde(default)]
    pub lines_written: u64,
    /// Fields written by other tools sharing the file; carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    pub at: String,
}

impl SessionState {
    pub fn failures(&self, task: &str) -> u32 {
        self.successive_failures.get(task).copied().unwrap_or(0)
    }

    /// Bump the task's failure counter and return the new count.
    pub fn record_failure(&mut self, task: &str) -> u32 {
        let count = self.successive_failures.entry(task.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_failures(&mut self, task: &str) {
        self.successive_failures.remove(task);
    }

    pub fn is_suspended(&self, task: &str) -> bool {
        self.suspended.iter().any(|t| t == task)
    }

    pub fn suspend(&mut self, task: &str) {
        if !self.is_suspended(task) {
            self.suspended.push(task.to_string());
        }
    }

    pub fn signal_pending(&self, kind: &str) -> bool {
        self.signal.as_ref().is_some_and(|s| s.kind == kind)
    }

    pub fn raise_signal(&mut self, kind: &str, message: &str) {
        self.signal = Some(Signal {
            kind: kind.to_string(),
            message: message.to_string(),
            at: crate::event::now_rfc3339(),
        });
    }

    /// Clear the pending signal if it is of `kind`.
    pub fn consume_signal(&mut self, kind: &str) -> bool {
        if self.signal_pending(kind) {
            self.signal = None;
            true
        } else {
            false
        }
    }

    pub fn note_tool(&mut self, tool: &str) {
        if !self.turn_tools.iter().any(|t| t == tool) {
            self.turn_tools.push(tool.to_string());
        }
    }
}

/// Load a session's state. Returns None if the file doesn't exist.
pub fn load_session(store: &ProjectStore, session_id: &str) -> Result<Option<SessionState>> {
    let path = store.session_path(session_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading session: {}", path.display()))?;
    let state = serde_json::from_str(&content)
        .with_context(|| format!("parsing session: {}", path.display()))?;
    Ok(Some(state))
}

pub fn save_session(store: &ProjectStore, session_id: &str, state: &SessionState) -> Result<()> {
    let path = store.session_path(session_id);
    let data = serde_json::to_string_pretty(state)?;
    tollgate_store::write_atomic(&path, data.as_bytes())
        .with_context(|| format!("saving session: {}", path.display()))?;
    Ok(())
}

/// Best-effort load: unreadable state starts over.
pub fn load_or_default(store: &ProjectStore, session_id: &str) -> SessionState {
    match load_session(store, session_id) {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(session_id, error = %e, "session state unreadable, starting fresh");
            SessionState::default()
        }
    }
}

/// Best-effort save.
pub fn persist(store: &ProjectStore, session_id: &str, state: &SessionState) {
    if let Err(e) = save_session(store, session_id, state) {
        tracing::warn!(session_id, error = %e, "failed to persist session state");
    }
}
