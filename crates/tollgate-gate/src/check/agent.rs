use crate::check::verdict::{extract_verdict, VerdictKind};
use crate::check::{mask_secrets, CheckOutcome, RunEnv};
use crate::config::{ReviewerConfig, Task};
use crate::error::GateError;
use crate::reviewer::{ReviewOutcome, ReviewRequest, Reviewer};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Everything needed to run one agent task, owned so it can move into a
/// spawned future.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub task: String,
    pub prompt: String,
    pub model: Option<String>,
    /// A model was configured on the task or the reviewer. Reviewer crashes
    /// are then hard failures.
    pub explicit_model: bool,
    pub fallback_model: Option<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: RunEnv,
}

/// Task model, then the configured default, then the event's default.
pub fn select_model(task: &Task, reviewer: &ReviewerConfig, event: &str) -> Option<String> {
    task.model
        .clone()
        .or_else(|| reviewer.model.clone())
        .or_else(|| reviewer.event_models.get(event).cloned())
}

pub async fn run_agent(run: &AgentRun, reviewer: &dyn Reviewer) -> Result<CheckOutcome, GateError> {
    let start = Instant::now();
    if run.prompt.trim().is_empty() {
        return Ok(CheckOutcome::skipped(
            "prompt resolved to empty text",
            start.elapsed(),
        ));
    }

    let request = ReviewRequest {
        prompt: run.prompt.clone(),
        model: run.model.clone(),
        cwd: run.cwd.clone(),
        timeout: run.timeout,
        env: run.env.clone(),
    };

    let failure = match reviewer.review(&request).await {
        ReviewOutcome::Completed { output } => {
            let verdict = extract_verdict(
                &run.task,
                &output,
                reviewer,
                run.fallback_model.as_deref(),
                &request,
            )
            .await?;
            let output = mask_secrets(&output);
            let reason = mask_secrets(&verdict.reason);
            return Ok(match verdict.kind {
                VerdictKind::Pass => CheckOutcome::passed(reason, output, start.elapsed()),
                VerdictKind::Skip => CheckOutcome::skipped(reason, start.elapsed()),
                VerdictKind::Fail => {
                    let reason = match &verdict.body {
                        Some(body) => format!("{reason}\n\n{}", mask_secrets(body)),
                        None => reason,
                    };
                    CheckOutcome::failed(reason, output, start.elapsed())
                }
            });
        }
        ReviewOutcome::Unavailable { reason } => {
            tracing::warn!(task = %run.task, %reason, "reviewer unavailable, skipping");
            return Ok(CheckOutcome::skipped(
                format!("reviewer unavailable ({reason})"),
                start.elapsed(),
            ));
        }
        ReviewOutcome::Crashed { error } => format!("reviewer crashed: {error}"),
        ReviewOutcome::TimedOut => {
            format!("reviewer timed out after {}s", run.timeout.as_secs())
        }
    };

    if run.explicit_model {
        let model = run.model.as_deref().unwrap_or_default();
        Ok(CheckOutcome::failed(
            format!("{failure} (model {model})"),
            String::new(),
            start.elapsed(),
        ))
    } else {
        tracing::warn!(task = %run.task, %failure, "reviewer failed, skipping");
        Ok(CheckOutcome::skipped(failure, start.elapsed()))
    }
}
