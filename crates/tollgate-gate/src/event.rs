//! Hook event descriptor: what fired, where, and for which session.

use serde_json::Value;
use std::path::PathBuf;

/// How an event's outcome affects the host, which also decides the default
/// advance-on-failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Runs before a tool call and can veto it (`PreToolUse`).
    Gate,
    /// Runs at a turn or commit boundary (`Stop`, `SubagentStop`, `PreCommit`).
    Turn,
    /// Everything else: observes, never vetoes on its own.
    Passive,
}

impl EventClass {
    pub fn of(event: &str) -> Self {
        match event {
            "PreToolUse" => Self::Gate,
            "Stop" | "SubagentStop" | "PreCommit" => Self::Turn,
            _ => Self::Passive,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HookEvent {
    pub name: String,
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Value,
    /// Already-rendered tool output, when the host supplied one.
    pub tool_output: Option<String>,
}

impl HookEvent {
    pub fn new(name: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, tool_input: Value) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_input = tool_input;
        self
    }

    /// Build from a hook's stdin payload. `event_override` wins over the
    /// payload's own event name (git hooks send no payload at all).
    pub fn from_payload(stdin: &str, event_override: Option<&str>) -> anyhow::Result<Self> {
        let raw: Value = if stdin.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(stdin)?
        };

        let name = match event_override {
            Some(name) => name.to_string(),
            None => get_str(&raw, "hook_event_name"),
        };
        if name.is_empty() {
            anyhow::bail!("hook payload has no event name; pass --event");
        }

        let cwd = match get_str(&raw, "cwd") {
            s if s.is_empty() => std::env::current_dir()?,
            s => PathBuf::from(s),
        };

        let tool_output = get_value(&raw, "tool_response")
            .or_else(|| get_value(&raw, "tool_output"))
            .map(render_output)
            .filter(|s| !s.is_empty());

        Ok(Self {
            name,
            cwd,
            session_id: non_empty(get_str(&raw, "session_id")),
            tool_name: non_empty(get_str(&raw, "tool_name")),
            tool_input: get_value(&raw, "tool_input").cloned().unwrap_or(Value::Null),
            tool_output,
        })
    }

    pub fn class(&self) -> EventClass {
        EventClass::of(&self.name)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn render_output(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => {
            // Bash results carry stdout/stderr separately.
            let parts: Vec<&str> = ["stdout", "stderr", "output"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                v.to_string()
            } else {
                parts.join("\n")
            }
        }
        other => other.to_string(),
    }
}

// ── Payload field access ──

/// Get a string field from JSON, trying snake_case first then camelCase.
/// Claude Code sends snake_case; some hosts and older payloads use camelCase.
pub(crate) fn get_str(v: &Value, snake_key: &str) -> String {
    get_value(v, snake_key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

pub(crate) fn get_value<'a>(v: &'a Value, snake_key: &str) -> Option<&'a Value> {
    v.get(snake_key)
        .or_else(|| v.get(snake_to_camel(snake_key)))
        .filter(|x| !x.is_null())
}

pub(crate) fn snake_to_camel(s: &str) -> String {
    let mut result = String::new();
    let mut capitalize_next = false;
    for ch in s.chars() {
        if ch == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            result.extend(ch.to_uppercase());
            capitalize_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_events() {
        assert_eq!(EventClass::of("PreToolUse"), EventClass::Gate);
        assert_eq!(EventClass::of("Stop"), EventClass::Turn);
        assert_eq!(EventClass::of("SubagentStop"), EventClass::Turn);
        assert_eq!(EventClass::of("PreCommit"), EventClass::Turn);
        assert_eq!(EventClass::of("PostToolUse"), EventClass::Passive);
        assert_eq!(EventClass::of("SessionStart"), EventClass::Passive);
    }

    #[test]
    fn parses_snake_case_payload() {
        let payload = json!({
            "hook_event_name": "PreToolUse",
            "session_id": "s1",
            "cwd": "/tmp/proj",
            "tool_name": "Bash",
            "tool_input": {"command": "ls"}
        });
        let ev = HookEvent::from_payload(&payload.to_string(), None).unwrap();
        assert_eq!(ev.name, "PreToolUse");
        assert_eq!(ev.session_id.as_deref(), Some("s1"));
        assert_eq!(ev.cwd, PathBuf::from("/tmp/proj"));
        assert_eq!(ev.tool_name.as_deref(), Some("Bash"));
        assert_eq!(ev.tool_input["command"], "ls");
        assert_eq!(ev.class(), EventClass::Gate);
    }

    #[test]
    fn parses_camel_case_payload() {
        let payload = json!({
            "hookEventName": "PostToolUse",
            "sessionId": "s2",
            "cwd": "/tmp/proj",
            "toolName": "Bash",
            "toolResponse": {"stdout": "ok", "stderr": ""}
        });
        let ev = HookEvent::from_payload(&payload.to_string(), None).unwrap();
        assert_eq!(ev.name, "PostToolUse");
        assert_eq!(ev.session_id.as_deref(), Some("s2"));
        assert_eq!(ev.tool_output.as_deref(), Some("ok"));
    }

    #[test]
    fn override_names_empty_payload() {
        let ev = HookEvent::from_payload("", Some("PreCommit")).unwrap();
        assert_eq!(ev.name, "PreCommit");
        assert!(ev.session_id.is_none());
        assert!(ev.cwd.is_absolute());
    }

    #[test]
    fn missing_event_name_is_an_error() {
        assert!(HookEvent::from_payload("{}", None).is_err());
        assert!(HookEvent::from_payload("not json", Some("Stop")).is_err());
    }

    #[test]
    fn snake_to_camel_converts() {
        assert_eq!(snake_to_camel("hook_event_name"), "hookEventName");
        assert_eq!(snake_to_camel("cwd"), "cwd");
    }
}
