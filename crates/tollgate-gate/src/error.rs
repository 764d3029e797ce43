use thiserror::Error;

/// Configuration-level failures. These are never soft: the gate logs them as
/// `BOOM` and blocks with the message verbatim so the operator can fix the
/// config.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("unknown builtin prompt `{0}` (known: review, tests, security)")]
    UnknownPrompt(String),

    #[error("unknown prompt variable `{{{{{0}}}}}`")]
    UnknownVariable(String),

    #[error("prompt variable `{{{{{0}}}}}` needs a session, but the event carries no session id")]
    NoSession(String),

    #[error("prompt variable `{{{{{0}}}}}` has no value in this context")]
    MissingValue(String),

    #[error("task `{task}` is missing `{field}`")]
    MissingField { task: String, field: &'static str },

    #[error("task name `{0}` appears more than once in the same hook entry")]
    DuplicateTask(String),

    #[error("invalid matcher `{pattern}`: {reason}")]
    BadMatcher { pattern: String, reason: String },

    #[error("reviewer output for `{0}` has no PASS/FAIL/SKIP verdict and the classifier could not label it")]
    Unclassifiable(String),
}
