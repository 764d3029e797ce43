//! Prompt resolution for agent tasks.
//!
//! A prompt is literal text or `builtin:<name>`. Either may contain `{{var}}`
//! placeholders. Every referenced variable must be known and must have a
//! value in the current context; anything else is a configuration error.

use crate::error::GateError;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tollgate_churn::ChurnStore;

const BUILTIN_PREFIX: &str = "builtin:";

/// Variables available without a session.
const CONTEXT_VARS: [&str; 5] = ["cwd", "event", "task", "tool_output", "diff"];
/// Variables that need a session id.
const SESSION_VARS: [&str; 2] = ["session_id", "session_diff"];

const VERDICT_INSTRUCTIONS: &str = "\
Start your answer with a single line `PASS: <one-line summary>`, \
`FAIL: <one-line reason>` or `SKIP: <why you cannot judge>`, \
then give details below it.";

pub fn builtin(name: &str) -> Option<String> {
    let body = match name {
        "review" => {
            "You are reviewing a change to the project in {{cwd}}.\n\
             Look for bugs, missing error handling, unclear naming and code that \
             does not do what it claims. Ignore pure style nits.\n\n\
             Changes since the last review:\n\n```diff\n{{diff}}\n```\n"
        }
        "tests" => {
            "You are checking test coverage for a change to the project in {{cwd}}.\n\
             Decide whether the new or changed behavior is exercised by tests. \
             Name the untested paths if it is not.\n\n\
             Changes since the last check:\n\n```diff\n{{diff}}\n```\n"
        }
        "security" => {
            "You are auditing a change to the project in {{cwd}} for security problems: \
             injection, unsafe deserialization, secrets in code, path traversal, \
             missing authorization checks and unsafe use of external input.\n\n\
             Changes since the last audit:\n\n```diff\n{{diff}}\n```\n"
        }
        _ => return None,
    };
    Some(format!("{body}\n{VERDICT_INSTRUCTIONS}\n"))
}

/// Supplies the whole-session diff. The gate does not track sessions across
/// commits itself; a host integration can.
pub trait DiffSource: Send + Sync {
    fn session_diff(&self, session_id: &str) -> Option<String>;
}

/// No session diffs available.
pub struct NoSessionDiff;

impl DiffSource for NoSessionDiff {
    fn session_diff(&self, _session_id: &str) -> Option<String> {
        None
    }
}

pub struct PromptContext<'a> {
    pub task: &'a str,
    pub event: &'a str,
    pub cwd: &'a Path,
    pub session_id: Option<&'a str>,
    pub tool_output: Option<&'a str>,
    pub churn: &'a ChurnStore,
    pub diffs: &'a dyn DiffSource,
}

impl PromptContext<'_> {
    fn value(&self, var: &str) -> Result<String, GateError> {
        if SESSION_VARS.contains(&var) && self.session_id.is_none() {
            return Err(GateError::NoSession(var.to_string()));
        }
        let value = match var {
            "cwd" => Some(self.cwd.display().to_string()),
            "event" => Some(self.event.to_string()),
            "task" => Some(self.task.to_string()),
            "tool_output" => self.tool_output.map(String::from),
            "diff" => self.churn.diff_since(self.task),
            "session_id" => self.session_id.map(String::from),
            "session_diff" => self
                .session_id
                .and_then(|sid| self.diffs.session_diff(sid)),
            other => return Err(GateError::UnknownVariable(other.to_string())),
        };
        value.ok_or_else(|| GateError::MissingValue(var.to_string()))
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .unwrap_or_else(|e| unreachable!("placeholder regex: {e}"))
    })
}

/// Resolve a task's prompt source into final text. Empty output means the
/// task has nothing to review and should be skipped.
pub fn resolve_prompt(source: &str, ctx: &PromptContext<'_>) -> Result<String, GateError> {
    let template = match source.trim().strip_prefix(BUILTIN_PREFIX) {
        Some(name) => {
            let name = name.trim();
            builtin(name).ok_or_else(|| GateError::UnknownPrompt(name.to_string()))?
        }
        None => source.to_string(),
    };

    // Validate names before computing any value, so a typo never costs a diff.
    for caps in placeholder().captures_iter(&template) {
        let var = &caps[1];
        if !CONTEXT_VARS.contains(&var) && !SESSION_VARS.contains(&var) {
            return Err(GateError::UnknownVariable(var.to_string()));
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(&template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&ctx.value(&caps[1])?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out.trim().to_string())
}
