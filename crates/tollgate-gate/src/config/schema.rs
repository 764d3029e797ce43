use crate::event::EventClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Project configuration, read from `.tollgate.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Globs selecting the files that count as source for churn.
    /// Empty means every file.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub reviewer: ReviewerConfig,
    #[serde(default)]
    pub appeal: AppealConfig,
    /// Event name → entries, in order.
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<HookEntry>>,
}

impl GateConfig {
    pub fn entries_for(&self, event: &str) -> &[HookEntry] {
        self.hooks.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every configured task with the event it belongs to.
    pub fn all_tasks(&self) -> impl Iterator<Item = (&str, &Task)> {
        self.hooks.iter().flat_map(|(event, entries)| {
            entries
                .iter()
                .flat_map(move |e| e.tasks.iter().map(move |t| (event.as_str(), t)))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    /// Reviewer binary, invoked as `<command> -p [--model M]` with the prompt on stdin.
    #[serde(default = "default_reviewer_command")]
    pub command: String,
    /// Context default model.
    #[serde(default)]
    pub model: Option<String>,
    /// Fast model used to classify reviewer output that carries no verdict line.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    /// Per-event default model, used when neither the task nor `model` names one.
    #[serde(default)]
    pub event_models: BTreeMap<String, String>,
    #[serde(default = "default_reviewer_timeout", rename = "timeout")]
    pub timeout_sec: u64,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            command: default_reviewer_command(),
            model: None,
            fallback_model: default_fallback_model(),
            event_models: BTreeMap::new(),
            timeout_sec: default_reviewer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealConfig {
    /// Successive failures before a backchannel file is offered.
    #[serde(default = "default_appeal_threshold")]
    pub threshold: u32,
    #[serde(default)]
    pub arbiter_model: Option<String>,
}

impl Default for AppealConfig {
    fn default() -> Self {
        Self {
            threshold: default_appeal_threshold(),
            arbiter_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEntry {
    /// Regex tested against the tool name. `None` matches every event.
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Script,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub command: Option<String>,
    /// Literal prompt or `builtin:<name>`.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub when: Option<When>,
    /// Overrides the event's default advance-on-failure policy.
    #[serde(default)]
    pub reset_on_fail: Option<bool>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Run detached; the result is collected by a later invocation.
    #[serde(default, rename = "async")]
    pub background: bool,
    #[serde(default)]
    pub parallel: bool,
}

impl Task {
    /// Whether the task's schedule depends on churn. Advance policy applies to
    /// these and to every agent task.
    pub fn is_churn_based(&self) -> bool {
        self.when.as_ref().is_some_and(When::is_churn_based)
    }

    pub fn tracks_churn(&self) -> bool {
        self.kind == TaskKind::Agent || self.is_churn_based()
    }

    pub fn timeout_for(&self, class: EventClass, reviewer: &ReviewerConfig) -> Duration {
        let secs = self.timeout.unwrap_or(match self.kind {
            TaskKind::Agent => reviewer.timeout_sec,
            TaskKind::Script if class == EventClass::Gate => DEFAULT_GATE_SCRIPT_TIMEOUT,
            TaskKind::Script => DEFAULT_SCRIPT_TIMEOUT,
        });
        Duration::from_secs(secs)
    }
}

/// Run conditions. Every present condition must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct When {
    /// Net churn threshold, in lines.
    #[serde(default)]
    pub lines_changed: Option<u64>,
    /// Gross churn threshold, in lines.
    #[serde(default)]
    pub lines_written: Option<u64>,
    /// Any net churn at all since the task last advanced.
    #[serde(default)]
    pub sources_modified: Option<bool>,
    #[serde(default)]
    pub file_exists: Option<String>,
    #[serde(default)]
    pub env_set: Option<String>,
    #[serde(default)]
    pub env_not_set: Option<String>,
    /// Session signal type that must be pending.
    #[serde(default)]
    pub signal: Option<String>,
    /// Any of these tools used this turn.
    #[serde(default)]
    pub tools_used: Option<Vec<String>>,
}

impl When {
    pub fn is_churn_based(&self) -> bool {
        self.lines_changed.is_some()
            || self.lines_written.is_some()
            || self.sources_modified == Some(true)
    }
}

pub const DEFAULT_GATE_SCRIPT_TIMEOUT: u64 = 30;
pub const DEFAULT_SCRIPT_TIMEOUT: u64 = 120;

fn default_reviewer_command() -> String {
    "claude".into()
}

fn default_fallback_model() -> Option<String> {
    Some("haiku".into())
}

fn default_reviewer_timeout() -> u64 {
    300
}

fn default_appeal_threshold() -> u32 {
    5
}
