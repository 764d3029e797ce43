//! Reviewer verdict extraction.
//!
//! A reviewer answers in free text. The verdict is the first line whose
//! leading token (after markdown decoration such as `#`, `*`, `_`, `>`) is
//! exactly `PASS`, `FAIL` or `SKIP`, optionally followed by `:` (or `-`) and
//! a reason.
//! Everything after that line is the body.
//!
//! When no line qualifies, a fast classifier model is asked for a one-word
//! label. Only if that fails too is the output reported as unclassifiable.

use crate::error::GateError;
use crate::reviewer::{ReviewOutcome, ReviewRequest, Reviewer};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictKind {
    Pass,
    Fail,
    Skip,
}

impl VerdictKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "SKIP" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub reason: String,
    pub body: Option<String>,
}

impl Verdict {
    /// `Some(true)` for PASS, `Some(false)` for FAIL, `None` for SKIP.
    pub fn pass(&self) -> Option<bool> {
        match self.kind {
            VerdictKind::Pass => Some(true),
            VerdictKind::Fail => Some(false),
            VerdictKind::Skip => None,
        }
    }
}

fn verdict_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[\s#*_>`\-]*([A-Za-z]+)[*_`]*(?:$|(?:\s*[:\-]|\s)[\s*_`]*(.*?)[\s*_`]*$)")
            .unwrap_or_else(|e| unreachable!("verdict regex: {e}"))
    })
}

/// Parse a verdict from reviewer output without any model call.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = verdict_line().captures(line) else {
            continue;
        };
        let Some(kind) = VerdictKind::from_token(&caps[1]) else {
            continue;
        };
        let reason = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let body = lines[i + 1..].join("\n").trim().to_string();
        let body = (!body.is_empty()).then_some(body);
        return Some(finish(kind, reason, body));
    }
    None
}

fn finish(kind: VerdictKind, reason: String, body: Option<String>) -> Verdict {
    if !reason.is_empty() {
        return Verdict { kind, reason, body };
    }
    match (kind, body) {
        // A bare verdict with a body: the body is the explanation.
        (_, Some(body)) => Verdict {
            kind,
            reason: body,
            body: None,
        },
        (VerdictKind::Fail, None) => Verdict {
            kind,
            reason: "reviewer reported FAIL without details".into(),
            body: None,
        },
        (VerdictKind::Skip, None) => Verdict {
            kind,
            reason: "reviewer skipped".into(),
            body: None,
        },
        (VerdictKind::Pass, None) => Verdict {
            kind,
            reason: String::new(),
            body: None,
        },
    }
}

/// Read a one-word classifier answer.
pub fn parse_label(text: &str) -> Option<VerdictKind> {
    text.split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| VerdictKind::from_token(&word.to_ascii_uppercase()))
}

fn classifier_prompt(transcript: &str) -> String {
    format!(
        "Below is the output of an automated code review. Decide whether the reviewer \
         approved the change (PASS), rejected it (FAIL), or declined to judge it (SKIP).\n\
         Answer with exactly one word: PASS, FAIL or SKIP.\n\n---\n{transcript}\n---\n"
    )
}

/// Parse `output`, falling back to the classifier model when it carries no
/// verdict line. `template` supplies cwd, timeout and environment for the
/// classifier call.
pub async fn extract_verdict(
    task: &str,
    output: &str,
    classifier: &dyn Reviewer,
    fallback_model: Option<&str>,
    template: &ReviewRequest,
) -> Result<Verdict, GateError> {
    if let Some(verdict) = parse_verdict(output) {
        return Ok(verdict);
    }
    tracing::debug!(task, "no verdict line, asking classifier");

    let request = ReviewRequest {
        prompt: classifier_prompt(output),
        model: fallback_model.map(String::from),
        ..template.clone()
    };
    let label = match classifier.review(&request).await {
        ReviewOutcome::Completed { output: answer } => parse_label(&answer),
        other => {
            tracing::warn!(task, ?other, "verdict classifier failed");
            None
        }
    };
    let kind = label.ok_or_else(|| GateError::Unclassifiable(task.to_string()))?;
    let reason = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| crate::check::truncate_chars(l, 200))
        .unwrap_or_default();
    Ok(finish(kind, reason, None))
}
