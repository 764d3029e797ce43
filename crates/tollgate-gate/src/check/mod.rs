pub mod agent;
pub mod prompt;
pub mod script;
pub mod verdict;

use crate::event::HookEvent;
use std::time::Duration;
use verdict::VerdictKind;

/// Normalized result of running one task.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub kind: VerdictKind,
    pub reason: String,
    /// Captured output, already masked.
    pub output: String,
    pub duration: Duration,
}

impl CheckOutcome {
    pub fn passed(reason: impl Into<String>, output: String, duration: Duration) -> Self {
        Self {
            kind: VerdictKind::Pass,
            reason: reason.into(),
            output,
            duration,
        }
    }

    pub fn failed(reason: impl Into<String>, output: String, duration: Duration) -> Self {
        Self {
            kind: VerdictKind::Fail,
            reason: reason.into(),
            output,
            duration,
        }
    }

    /// A soft skip: the task could not meaningfully run and does not block.
    pub fn skipped(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: VerdictKind::Skip,
            reason: reason.into(),
            output: String::new(),
            duration,
        }
    }

    /// Whether the outcome lets the host proceed. Skips do.
    pub fn pass(&self) -> bool {
        self.kind != VerdictKind::Fail
    }

    pub fn is_skip(&self) -> bool {
        self.kind == VerdictKind::Skip
    }
}

/// Environment handed to every child the gate spawns.
#[derive(Debug, Clone, Default)]
pub struct RunEnv {
    vars: Vec<(String, String)>,
}

impl RunEnv {
    pub fn for_task(event: &HookEvent, task: &str) -> Self {
        let mut vars = vec![
            (crate::ACTIVE_ENV.to_string(), "1".to_string()),
            ("TOLLGATE_EVENT".to_string(), event.name.clone()),
            ("TOLLGATE_TASK".to_string(), task.to_string()),
        ];
        if let Some(sid) = &event.session_id {
            vars.push(("TOLLGATE_SESSION_ID".to_string(), sid.clone()));
        }
        Self { vars }
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

/// Mask secrets in output strings before storing.
pub fn mask_secrets(text: &str) -> String {
    let patterns = [
        // API keys
        (r"sk-[a-zA-Z0-9_\-]{20,}", "[MASKED]"),
        (r"pk-[a-zA-Z0-9]{20,}", "[MASKED]"),
        (r"gh[pousr]_[A-Za-z0-9]{30,}", "[MASKED]"),
        // Bearer tokens
        (r"Bearer\s+[a-zA-Z0-9._\-]+", "Bearer [MASKED]"),
        // key=value patterns
        (
            r"(?i)(password|secret|token|key|api_key|apikey)=[^\s&]+",
            "$1=[MASKED]",
        ),
    ];

    let mut result = text.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            result = re.replace_all(&result, replacement).into_owned();
        }
    }
    result
}

/// Last `max_lines` lines of `text`, capped at `max_chars` characters.
pub fn tail(text: &str, max_lines: usize, max_chars: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let joined = lines[start..].join("\n");
    let count = joined.chars().count();
    if count <= max_chars {
        return joined;
    }
    let skipped: String = joined.chars().skip(count - max_chars).collect();
    format!("...{skipped}")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_api_keys() {
        let input = "Error: sk-ant1234567890abcdefghij is invalid";
        let masked = mask_secrets(input);
        assert!(masked.contains("[MASKED]"));
        assert!(!masked.contains("sk-ant"));
    }

    #[test]
    fn mask_key_value() {
        let input = "password=hunter2&token=abc123";
        let masked = mask_secrets(input);
        assert!(masked.contains("password=[MASKED]"));
        assert!(masked.contains("token=[MASKED]"));
    }

    #[test]
    fn no_mask_normal_text() {
        let input = "cargo test --workspace passed";
        assert_eq!(mask_secrets(input), input);
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=50).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let t = tail(&text, 3, 1000);
        assert_eq!(t, "48\n49\n50");
    }

    #[test]
    fn tail_caps_characters_on_char_boundary() {
        let text = "é".repeat(10);
        let t = tail(&text, 5, 4);
        assert_eq!(t, format!("...{}", "é".repeat(4)));
    }

    #[test]
    fn skip_counts_as_pass() {
        let out = CheckOutcome::skipped("reviewer unavailable", Duration::ZERO);
        assert!(out.pass());
        assert!(out.is_skip());
        assert!(!CheckOutcome::failed("x", String::new(), Duration::ZERO).pass());
    }

    #[test]
    fn run_env_carries_guard_and_session() {
        let ev = HookEvent::new("Stop", "/tmp").with_session("s1");
        let env = RunEnv::for_task(&ev, "lint");
        let get = |k: &str| env.vars().iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get(crate::ACTIVE_ENV), Some("1"));
        assert_eq!(get("TOLLGATE_TASK"), Some("lint"));
        assert_eq!(get("TOLLGATE_SESSION_ID"), Some("s1"));
    }
}
