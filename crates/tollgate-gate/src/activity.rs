//! Turn tracking fed by passive events.
//!
//! `UserPromptSubmit` starts a new turn. `PostToolUse` records the tool and,
//! for file-writing tools, how many lines it wrote; those lines also feed the
//! global gross-churn counter.

use crate::event::HookEvent;
use crate::session::SessionState;
use serde_json::Value;
use tollgate_churn::ChurnStore;

/// Lines a file-writing tool call wrote. 0 for every other tool.
pub fn written_lines(tool_name: &str, input: &Value) -> u64 {
    let count = |v: Option<&Value>| v.and_then(Value::as_str).map_or(0, line_count);
    match tool_name {
        "Write" => count(input.get("content")),
        "Edit" => count(input.get("new_string")),
        "MultiEdit" => input
            .get("edits")
            .and_then(Value::as_array)
            .map_or(0, |edits| edits.iter().map(|e| count(e.get("new_string"))).sum()),
        _ => 0,
    }
}

fn line_count(text: &str) -> u64 {
    text.lines().count() as u64
}

/// Update the session (and the gross counter) for this event.
/// Returns true when the session changed.
pub fn observe(event: &HookEvent, session: &mut SessionState, churn: &ChurnStore) -> bool {
    match event.name.as_str() {
        "UserPromptSubmit" => {
            let changed = !session.turn_tools.is_empty();
            session.turn_tools.clear();
            changed
        }
        "PostToolUse" => {
            let Some(tool) = event.tool_name.as_deref() else {
                return false;
            };
            session.note_tool(tool);
            let lines = written_lines(tool, &event.tool_input);
            if lines > 0 {
                session.lines_written += lines;
                if !churn.increment_gross(lines as i64) {
                    tracing::debug!(tool, lines, "gross counter not incremented");
                }
            }
            true
        }
        _ => false,
    }
}
