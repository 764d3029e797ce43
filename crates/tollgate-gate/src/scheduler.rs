//! Whether a task runs for this event, and what its outcome does to the
//! task's churn baseline.
//!
//! Advance policy, for tasks that track churn (agent tasks and tasks with a
//! churn-based `when`):
//!
//! | outcome | Gate event | Turn / Passive event |
//! |---------|------------|----------------------|
//! | pass    | advance    | advance              |
//! | fail    | advance    | keep                 |
//!
//! `resetOnFail` replaces the failure column when set.

use crate::check::CheckOutcome;
use crate::config::Task;
use crate::event::{EventClass, HookEvent};
use crate::session::SessionState;
use tollgate_churn::ChurnStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(String),
}

/// Whether the task's baseline moves after an outcome.
pub fn advances(passed: bool, class: EventClass, reset_on_fail: Option<bool>) -> bool {
    if passed {
        return true;
    }
    reset_on_fail.unwrap_or(class == EventClass::Gate)
}

pub struct Scheduler<'a> {
    churn: &'a ChurnStore,
    event: &'a HookEvent,
}

impl<'a> Scheduler<'a> {
    pub fn new(churn: &'a ChurnStore, event: &'a HookEvent) -> Self {
        Self { churn, event }
    }

    pub fn should_run(&self, task: &Task, session: &SessionState) -> Decision {
        if session.is_suspended(&task.name) {
            return Decision::Skip("suspended for this session".into());
        }
        let Some(when) = &task.when else {
            return Decision::Run;
        };

        if let Some(var) = &when.env_set {
            if !env_is_set(var) {
                return Decision::Skip(format!("${var} is not set"));
            }
        }
        if let Some(var) = &when.env_not_set {
            if env_is_set(var) {
                return Decision::Skip(format!("${var} is set"));
            }
        }
        if let Some(path) = &when.file_exists {
            if !self.event.cwd.join(path).exists() {
                return Decision::Skip(format!("{path} does not exist"));
            }
        }
        if let Some(kind) = &when.signal {
            if !session.signal_pending(kind) {
                return Decision::Skip(format!("no `{kind}` signal pending"));
            }
        }
        if let Some(tools) = &when.tools_used {
            if !tools.iter().any(|t| session.turn_tools.contains(t)) {
                return Decision::Skip(format!("none of {} used this turn", tools.join(", ")));
            }
        }

        // Churn last: it costs git invocations.
        if when.lines_changed.is_some() || when.sources_modified == Some(true) {
            let net = self.churn.net_churn_since(&task.name);
            if let Some(threshold) = when.lines_changed {
                if net < threshold {
                    return Decision::Skip(format!("{net} of {threshold} changed lines"));
                }
            }
            if when.sources_modified == Some(true) && net == 0 {
                return Decision::Skip("no source changes".into());
            }
        }
        if let Some(threshold) = when.lines_written {
            let gross = self.churn.gross_churn_since(&task.name);
            if gross < threshold {
                return Decision::Skip(format!("{gross} of {threshold} written lines"));
            }
        }
        Decision::Run
    }

    /// Apply an outcome: move the baseline per the advance policy, and on a
    /// pass clear the failure streak and consume the triggering signal.
    /// `class` is the class of the event the task ran for, which differs from
    /// the current one for collected background tasks.
    /// Returns whether the baseline moved.
    pub fn settle(
        &self,
        task: &Task,
        class: EventClass,
        outcome: &CheckOutcome,
        session: &mut SessionState,
    ) -> bool {
        let passed = outcome.pass();
        if passed {
            session.reset_failures(&task.name);
            if let Some(kind) = task.when.as_ref().and_then(|w| w.signal.as_deref()) {
                session.consume_signal(kind);
            }
        }

        if !task.tracks_churn() || !advances(passed, class, task.reset_on_fail) {
            return false;
        }
        let net = self.churn.advance_snapshot(&task.name);
        let gross = self.churn.advance_gross_snapshot(&task.name);
        if !(net && gross) {
            tracing::debug!(task = %task.name, net, gross, "baseline not fully advanced");
        }
        net
    }
}

fn env_is_set(var: &str) -> bool {
    std::env::var_os(var).is_some_and(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TaskKind, When};
    use std::path::Path;
    use std::process::Command;
    use std::time::Duration;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@test.com"]);
        git(dir, &["config", "user.name", "Test"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        std::fs::write(dir.join("lib.rs"), "a\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    fn write_lines(dir: &Path, n: usize) {
        let body: String = (0..n).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.join("new.rs"), body).unwrap();
    }

    fn task(kind: TaskKind, when: Option<When>) -> Task {
        Task {
            name: "t".into(),
            kind,
            command: Some("true".into()),
            prompt: Some("p".into()),
            model: None,
            when,
            reset_on_fail: None,
            timeout: None,
            background: false,
            parallel: false,
        }
    }

    fn lines_changed(n: u64) -> Option<When> {
        Some(When {
            lines_changed: Some(n),
            ..When::default()
        })
    }

    fn pass() -> CheckOutcome {
        CheckOutcome::passed("", String::new(), Duration::ZERO)
    }

    fn fail() -> CheckOutcome {
        CheckOutcome::failed("exit 1", String::new(), Duration::ZERO)
    }

    #[test]
    fn advance_policy_table() {
        use EventClass::*;
        assert!(advances(true, Gate, None));
        assert!(advances(true, Turn, None));
        assert!(advances(true, Passive, None));
        assert!(advances(false, Gate, None));
        assert!(!advances(false, Turn, None));
        assert!(!advances(false, Passive, None));
        // Override wins in both directions.
        assert!(!advances(false, Gate, Some(false)));
        assert!(advances(false, Turn, Some(true)));
        assert!(advances(true, Turn, Some(false)));
    }

    #[test]
    fn unconditional_task_runs() {
        let dir = tempfile::tempdir().unwrap();
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        assert_eq!(s.should_run(&task(TaskKind::Script, None), &SessionState::default()), Decision::Run);
    }

    #[test]
    fn suspended_task_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let mut session = SessionState::default();
        session.suspend("t");
        let s = Scheduler::new(&churn, &ev);
        assert!(matches!(s.should_run(&task(TaskKind::Script, None), &session), Decision::Skip(_)));
    }

    #[test]
    fn churn_threshold_gates_the_run() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(TaskKind::Script, lines_changed(5));
        let session = SessionState::default();

        // First sight bootstraps the baseline.
        assert!(matches!(s.should_run(&t, &session), Decision::Skip(_)));
        write_lines(dir.path(), 3);
        assert_eq!(s.should_run(&t, &session), Decision::Skip("3 of 5 changed lines".into()));
        write_lines(dir.path(), 10);
        assert_eq!(s.should_run(&t, &session), Decision::Run);
    }

    #[test]
    fn failure_on_turn_event_keeps_churn() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(TaskKind::Script, lines_changed(5));
        let mut session = SessionState::default();
        s.should_run(&t, &session);
        write_lines(dir.path(), 10);

        assert!(!s.settle(&t, ev.class(), &fail(), &mut session));
        assert_eq!(churn.net_churn_since("t"), 10);

        assert!(s.settle(&t, ev.class(), &pass(), &mut session));
        assert_eq!(churn.net_churn_since("t"), 0);
    }

    #[test]
    fn failure_on_gate_event_advances() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("PreToolUse", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(TaskKind::Script, lines_changed(5));
        let mut session = SessionState::default();
        s.should_run(&t, &session);
        write_lines(dir.path(), 10);

        assert!(s.settle(&t, ev.class(), &fail(), &mut session));
        assert_eq!(churn.net_churn_since("t"), 0);
    }

    #[test]
    fn non_churn_script_never_touches_refs() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let mut session = SessionState::default();
        assert!(!s.settle(&task(TaskKind::Script, None), ev.class(), &pass(), &mut session));
        assert!(!churn.tracks("t"));

        // Agent tasks always track.
        assert!(s.settle(&task(TaskKind::Agent, None), ev.class(), &pass(), &mut session));
        assert!(churn.tracks("t"));
    }

    #[test]
    fn pass_resets_failures_and_consumes_signal() {
        let dir = tempfile::tempdir().unwrap();
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(
            TaskKind::Script,
            Some(When {
                signal: Some("review".into()),
                ..When::default()
            }),
        );
        let mut session = SessionState::default();
        assert!(matches!(s.should_run(&t, &session), Decision::Skip(_)));

        session.raise_signal("review", "");
        session.record_failure("t");
        assert_eq!(s.should_run(&t, &session), Decision::Run);

        s.settle(&t, ev.class(), &fail(), &mut session);
        assert!(session.signal_pending("review"), "failure keeps the signal");
        s.settle(&t, ev.class(), &pass(), &mut session);
        assert_eq!(session.failures("t"), 0);
        assert!(session.signal.is_none());
    }

    #[test]
    fn file_and_tool_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(
            TaskKind::Script,
            Some(When {
                file_exists: Some("Cargo.toml".into()),
                tools_used: Some(vec!["Edit".into(), "Write".into()]),
                ..When::default()
            }),
        );
        let mut session = SessionState::default();
        assert_eq!(s.should_run(&t, &session), Decision::Skip("Cargo.toml does not exist".into()));
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert!(matches!(s.should_run(&t, &session), Decision::Skip(_)));
        session.note_tool("Write");
        assert_eq!(s.should_run(&t, &session), Decision::Run);
    }

    #[test]
    fn env_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let churn = ChurnStore::new(dir.path(), &[]).unwrap();
        let ev = HookEvent::new("Stop", dir.path());
        let s = Scheduler::new(&churn, &ev);
        let t = task(
            TaskKind::Script,
            Some(When {
                env_not_set: Some("TOLLGATE_TEST_SURELY_UNSET_VAR".into()),
                ..When::default()
            }),
        );
        assert_eq!(s.should_run(&t, &SessionState::default()), Decision::Run);

        let t = task(
            TaskKind::Script,
            Some(When {
                env_set: Some("TOLLGATE_TEST_SURELY_UNSET_VAR".into()),
                ..When::default()
            }),
        );
        assert!(matches!(s.should_run(&t, &SessionState::default()), Decision::Skip(_)));
    }
}
