//! Escalation for script tasks that keep failing within one session.
//!
//! Below the threshold a failure passes through unchanged. At the threshold a
//! backchannel file is created and the failure gains a pointer to it. Above
//! it, any appeal written in the file goes to an arbiter model; a granted
//! appeal suspends the task for the rest of the session. Every error on the
//! arbiter path keeps the task blocking.

pub mod backchannel;

use crate::check::verdict::{parse_verdict, VerdictKind};
use crate::check::{tail, CheckOutcome, RunEnv};
use crate::config::AppealConfig;
use crate::reviewer::{ReviewOutcome, ReviewRequest, Reviewer};
use crate::session::SessionState;
use backchannel::{Backchannel, FailureContext};
use std::path::Path;
use std::time::Duration;
use tollgate_store::ProjectStore;

/// What the arbiter made of an appeal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ruling {
    Granted(String),
    Denied(String),
    /// The arbiter could not be asked or gave no usable answer.
    Unreviewed(String),
}

#[derive(Debug, Clone)]
pub struct AppealResult {
    pub outcome: CheckOutcome,
    pub ruling: Option<Ruling>,
}

pub struct AppealArbiter<'a> {
    pub store: &'a ProjectStore,
    pub reviewer: &'a dyn Reviewer,
    pub config: &'a AppealConfig,
    pub cwd: &'a Path,
    pub timeout: Duration,
}

impl AppealArbiter<'_> {
    /// Record a script failure and escalate per the failure count.
    pub async fn on_failure(
        &self,
        session: &mut SessionState,
        session_id: &str,
        task: &str,
        command: &str,
        env: &RunEnv,
        mut failure: CheckOutcome,
    ) -> AppealResult {
        let count = session.record_failure(task);
        let threshold = self.config.threshold.max(1);
        if count < threshold {
            return AppealResult {
                outcome: failure,
                ruling: None,
            };
        }

        let channel = Backchannel::new(self.store, session_id, task);
        let ctx = FailureContext {
            task,
            command,
            failures: count,
            reason: &failure.reason,
        };
        let prepared = if count == threshold || !channel.exists() {
            channel.create(&ctx).map(|_| ())
        } else {
            channel.refresh_context(&ctx).map(|_| ())
        };
        if let Err(e) = prepared {
            tracing::warn!(task, error = %e, "cannot write backchannel");
            return AppealResult {
                outcome: failure,
                ruling: None,
            };
        }

        let appeal = if count > threshold {
            channel.appeal_text()
        } else {
            None
        };
        let Some(appeal) = appeal else {
            failure.reason.push_str(&hint(count, channel.path()));
            return AppealResult {
                outcome: failure,
                ruling: None,
            };
        };

        let ruling = self.arbitrate(task, command, count, &failure, &appeal, env).await;
        match &ruling {
            Ruling::Granted(reason) => {
                tracing::info!(task, session_id, "appeal granted, task suspended");
                session.suspend(task);
                session.reset_failures(task);
                channel.remove();
                let outcome = CheckOutcome::skipped(
                    format!("appeal granted, `{task}` suspended for this session: {reason}"),
                    failure.duration,
                );
                AppealResult {
                    outcome,
                    ruling: Some(ruling),
                }
            }
            Ruling::Denied(reason) => {
                failure
                    .reason
                    .push_str(&format!("\n\nAppeal denied: {reason}"));
                failure.reason.push_str(&hint(count, channel.path()));
                AppealResult {
                    outcome: failure,
                    ruling: Some(ruling),
                }
            }
            Ruling::Unreviewed(why) => {
                failure
                    .reason
                    .push_str(&format!("\n\nAppeal could not be reviewed ({why}); still blocking."));
                AppealResult {
                    outcome: failure,
                    ruling: Some(ruling),
                }
            }
        }
    }

    /// Delete the task's backchannel, if any.
    pub fn clear(&self, session_id: &str, task: &str) -> bool {
        Backchannel::new(self.store, session_id, task).remove()
    }

    async fn arbitrate(
        &self,
        task: &str,
        command: &str,
        count: u32,
        failure: &CheckOutcome,
        appeal: &str,
        env: &RunEnv,
    ) -> Ruling {
        let evidence = if failure.output.is_empty() {
            failure.reason.clone()
        } else {
            tail(&failure.output, 60, 4000)
        };
        let request = ReviewRequest {
            prompt: arbiter_prompt(task, command, count, &evidence, appeal),
            model: self.config.arbiter_model.clone(),
            cwd: self.cwd.to_path_buf(),
            timeout: self.timeout,
            env: env.clone(),
        };
        let output = match self.reviewer.review(&request).await {
            ReviewOutcome::Completed { output } => output,
            ReviewOutcome::Unavailable { reason } => return Ruling::Unreviewed(reason),
            ReviewOutcome::Crashed { error } => return Ruling::Unreviewed(error),
            ReviewOutcome::TimedOut => return Ruling::Unreviewed("arbiter timed out".into()),
        };
        match parse_verdict(&output) {
            Some(v) if v.kind == VerdictKind::Fail => Ruling::Denied(v.reason),
            Some(v) => Ruling::Granted(if v.reason.is_empty() {
                "no reason given".into()
            } else {
                v.reason
            }),
            None => Ruling::Unreviewed("arbiter gave no verdict".into()),
        }
    }
}

fn hint(count: u32, path: &Path) -> String {
    format!(
        "\n\nThis check has failed {count} times in a row. If it should be set aside \
         for this session, write your case under `## Appeal` in {} and try again.",
        path.display()
    )
}

fn arbiter_prompt(task: &str, command: &str, count: u32, evidence: &str, appeal: &str) -> String {
    format!(
        "A developer is appealing an automated check that keeps blocking their work.\n\
         Decide whether check `{task}` should be suspended for the rest of this session.\n\
         Grant the appeal only if the failure is plainly unrelated to the developer's \
         changes (a broken environment, a known flaky test, a check that is itself wrong). \
         Deny it if the failure points at a real problem the developer should fix.\n\n\
         Command: `{command}`\n\
         Consecutive failures: {count}\n\n\
         Latest output:\n```\n{evidence}\n```\n\n\
         Appeal:\n{appeal}\n\n\
         Start your answer with `PASS: <reason>` to grant or `FAIL: <reason>` to deny.\n"
    )
}
