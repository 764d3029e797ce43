//! One gate invocation: schedule, run and settle every task configured for
//! an event.

use crate::activity;
use crate::appeal::{AppealArbiter, Ruling};
use crate::check::agent::{run_agent, select_model, AgentRun};
use crate::check::prompt::{resolve_prompt, DiffSource, NoSessionDiff, PromptContext};
use crate::check::script::run_script;
use crate::check::{CheckOutcome, RunEnv};
use crate::config::{GateConfig, Task, TaskKind};
use crate::detached::{self, DetachedJob};
use crate::error::GateError;
use crate::event::{EventClass, HookEvent};
use crate::event_log::{EventLogger, Status};
use crate::reviewer::{ClaudeReviewer, Reviewer};
use crate::scheduler::{Decision, Scheduler};
use crate::session::{self, SessionState};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tollgate_churn::ChurnStore;
use tollgate_store::ProjectStore;

/// Whether this process was spawned by a gate task.
pub fn recursion_guarded() -> bool {
    std::env::var_os(crate::ACTIVE_ENV).is_some_and(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: String,
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub event: String,
    pub tasks: Vec<TaskReport>,
}

impl GateReport {
    fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            tasks: Vec::new(),
        }
    }

    fn push(&mut self, task: &str, outcome: CheckOutcome) {
        self.tasks.push(TaskReport {
            task: task.to_string(),
            outcome,
        });
    }

    pub fn blocked(&self) -> bool {
        self.tasks.iter().any(|t| !t.outcome.pass())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.outcome.pass())
    }

    /// Failure reasons, one block per task.
    pub fn message(&self) -> String {
        self.failures()
            .map(|t| format!("[{}] {}", t.task, t.outcome.reason))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Soft skips worth surfacing (reviewer unavailable and the like).
    pub fn warnings(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.outcome.is_skip() && !t.outcome.reason.is_empty())
            .map(|t| format!("[{}] skipped: {}", t.task, t.outcome.reason))
            .collect()
    }
}

/// A task ready to run: everything owned, so it can move onto another task.
enum Execution {
    Script {
        command: String,
        cwd: PathBuf,
        timeout: Duration,
        env: RunEnv,
    },
    Agent(AgentRun),
}

impl Execution {
    async fn execute(self, reviewer: Arc<dyn Reviewer>) -> Result<CheckOutcome, GateError> {
        match self {
            Self::Script {
                command,
                cwd,
                timeout,
                env,
            } => Ok(run_script(&command, &cwd, timeout, &env).await),
            Self::Agent(run) => run_agent(&run, reviewer.as_ref()).await,
        }
    }
}

enum Slot<'c> {
    Done(&'c Task, Result<CheckOutcome, GateError>),
    Spawned(&'c Task, tokio::task::JoinHandle<Result<CheckOutcome, GateError>>),
}

pub struct Gate {
    config: GateConfig,
    store: ProjectStore,
    reviewer: Arc<dyn Reviewer>,
    diffs: Arc<dyn DiffSource>,
}

impl Gate {
    pub fn new(config: GateConfig, store: ProjectStore) -> Self {
        let reviewer = Arc::new(ClaudeReviewer::with_bin(PathBuf::from(&config.reviewer.command)));
        Self {
            config,
            store,
            reviewer,
            diffs: Arc::new(NoSessionDiff),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_diffs(mut self, diffs: Arc<dyn DiffSource>) -> Self {
        self.diffs = diffs;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub async fn run(&self, event: &HookEvent) -> anyhow::Result<GateReport> {
        let mut report = GateReport::new(&event.name);
        if recursion_guarded() {
            tracing::debug!(event = %event.name, "spawned by a gate task, not gating");
            return Ok(report);
        }

        let churn = ChurnStore::new(&event.cwd, &self.config.sources)?;
        let sid = event.session_id.as_deref();
        let mut session = sid
            .map(|s| session::load_or_default(&self.store, s))
            .unwrap_or_default();
        let before = session.clone();
        let mut log = EventLogger::new(&self.store, sid, &event.name);
        let scheduler = Scheduler::new(&churn, event);

        activity::observe(event, &mut session, &churn);
        self.collect_background(event, &scheduler, &mut session, &mut log, &mut report)
            .await;

        let class = event.class();
        let mut slots = Vec::new();
        for task in self.scheduled(event) {
            if let Decision::Skip(why) = scheduler.should_run(task, &session) {
                tracing::debug!(task = %task.name, %why, "not scheduled");
                continue;
            }
            log.running(&task.name);

            let execution = match self.prepare(task, event, &churn) {
                Ok(execution) => execution,
                Err(e) => {
                    slots.push(Slot::Done(task, Err(e)));
                    continue;
                }
            };

            match execution {
                Execution::Script {
                    command,
                    cwd,
                    timeout,
                    env,
                } if task.background => {
                    let job = DetachedJob::new(&task.name, &event.name, sid, &command, timeout);
                    let outcome = match detached::spawn(&self.store, job, &cwd, &env) {
                        Ok(job) => CheckOutcome::skipped(
                            format!("running in background (job {})", job.id),
                            Duration::ZERO,
                        ),
                        Err(e) => CheckOutcome::failed(format!("{e:#}"), String::new(), Duration::ZERO),
                    };
                    log.outcome(&task.name, &outcome);
                    if !outcome.pass() {
                        report.push(&task.name, outcome);
                    }
                }
                execution if task.parallel => {
                    let handle = tokio::spawn(execution.execute(self.reviewer.clone()));
                    slots.push(Slot::Spawned(task, handle));
                }
                execution => {
                    let result = execution.execute(self.reviewer.clone()).await;
                    slots.push(Slot::Done(task, result));
                }
            }
        }

        for slot in slots {
            let (task, result) = match slot {
                Slot::Done(task, result) => (task, result),
                Slot::Spawned(task, handle) => match handle.await {
                    Ok(result) => (task, result),
                    Err(e) => (
                        task,
                        Ok(CheckOutcome::failed(
                            format!("task panicked: {e}"),
                            String::new(),
                            Duration::ZERO,
                        )),
                    ),
                },
            };
            let outcome = match result {
                Ok(outcome) => {
                    self.settle(task, class, event, outcome, &scheduler, &mut session, &mut log)
                        .await
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(task = %task.name, error = %message, "configuration error");
                    log.record(&task.name, Status::Boom, Some(&message), None);
                    CheckOutcome::failed(message, String::new(), Duration::ZERO)
                }
            };
            report.push(&task.name, outcome);
        }

        if let Some(sid) = sid {
            if session != before {
                session::persist(&self.store, sid, &session);
            }
        }
        Ok(report)
    }

    /// Tasks of every entry whose matcher accepts this event, in order.
    fn scheduled<'c>(&'c self, event: &HookEvent) -> Vec<&'c Task> {
        let tool = event.tool_name.as_deref();
        self.config
            .entries_for(&event.name)
            .iter()
            .filter(|entry| match (&entry.matcher, tool) {
                (Some(pattern), Some(tool)) => Regex::new(pattern)
                    .map(|re| re.is_match(tool))
                    .unwrap_or(false),
                _ => true,
            })
            .flat_map(|entry| entry.tasks.iter())
            .collect()
    }

    fn prepare(&self, task: &Task, event: &HookEvent, churn: &ChurnStore) -> Result<Execution, GateError> {
        let env = RunEnv::for_task(event, &task.name);
        let timeout = task.timeout_for(event.class(), &self.config.reviewer);
        let missing = |field| GateError::MissingField {
            task: task.name.clone(),
            field,
        };
        match task.kind {
            TaskKind::Script => Ok(Execution::Script {
                command: task.command.clone().ok_or_else(|| missing("command"))?,
                cwd: event.cwd.clone(),
                timeout,
                env,
            }),
            TaskKind::Agent => {
                let source = task.prompt.as_deref().ok_or_else(|| missing("prompt"))?;
                let ctx = PromptContext {
                    task: &task.name,
                    event: &event.name,
                    cwd: &event.cwd,
                    session_id: event.session_id.as_deref(),
                    tool_output: event.tool_output.as_deref(),
                    churn,
                    diffs: self.diffs.as_ref(),
                };
                let prompt = resolve_prompt(source, &ctx)?;
                let reviewer = &self.config.reviewer;
                Ok(Execution::Agent(AgentRun {
                    task: task.name.clone(),
                    prompt,
                    model: select_model(task, reviewer, &event.name),
                    explicit_model: task.model.is_some() || reviewer.model.is_some(),
                    fallback_model: reviewer.fallback_model.clone(),
                    cwd: event.cwd.clone(),
                    timeout,
                    env,
                }))
            }
        }
    }

    /// Appeal (script failures with a session), advance, clean up and log.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        task: &Task,
        class: EventClass,
        event: &HookEvent,
        mut outcome: CheckOutcome,
        scheduler: &Scheduler<'_>,
        session: &mut SessionState,
        log: &mut EventLogger,
    ) -> CheckOutcome {
        let arbiter = AppealArbiter {
            store: &self.store,
            reviewer: self.reviewer.as_ref(),
            config: &self.config.appeal,
            cwd: &event.cwd,
            timeout: Duration::from_secs(self.config.reviewer.timeout_sec),
        };

        if let (false, TaskKind::Script, Some(sid)) =
            (outcome.pass(), task.kind, event.session_id.as_deref())
        {
            let command = task.command.as_deref().unwrap_or_default();
            let env = RunEnv::for_task(event, &task.name);
            let result = arbiter
                .on_failure(session, sid, &task.name, command, &env, outcome)
                .await;
            if let Some(ruling) = &result.ruling {
                let note = match ruling {
                    Ruling::Granted(r) => format!("granted: {r}"),
                    Ruling::Denied(r) => format!("denied: {r}"),
                    Ruling::Unreviewed(r) => format!("unreviewed: {r}"),
                };
                log.record(&task.name, Status::Appeal, Some(&note), None);
            }
            outcome = result.outcome;
        }

        scheduler.settle(task, class, &outcome, session);
        if outcome.pass() {
            if let Some(sid) = event.session_id.as_deref() {
                arbiter.clear(sid, &task.name);
            }
        }
        log.outcome(&task.name, &outcome);
        outcome
    }

    /// Fold in background tasks that finished since the last invocation.
    /// Each outcome settles as if its task had just run on the job's event.
    async fn collect_background(
        &self,
        event: &HookEvent,
        scheduler: &Scheduler<'_>,
        session: &mut SessionState,
        log: &mut EventLogger,
        report: &mut GateReport,
    ) {
        for finished in detached::collect(&self.store, event.session_id.as_deref()) {
            let job = &finished.job;
            let outcome = match self.find_task(&job.event, &job.task) {
                Some(task) => {
                    let origin = HookEvent {
                        name: job.event.clone(),
                        ..event.clone()
                    };
                    let class = EventClass::of(&job.event);
                    self.settle(task, class, &origin, finished.outcome, scheduler, session, log)
                        .await
                }
                None => {
                    tracing::debug!(task = %job.task, "background task no longer configured");
                    log.outcome(&job.task, &finished.outcome);
                    finished.outcome
                }
            };
            report.push(&job.task, outcome);
        }
    }

    fn find_task(&self, event: &str, name: &str) -> Option<&Task> {
        self.config
            .entries_for(event)
            .iter()
            .flat_map(|e| e.tasks.iter())
            .find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::reviewer::MockReviewer;
    use std::path::Path;
    use std::process::Command;

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
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/lib.rs"), "a\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    fn write_lines(dir: &Path, n: usize) {
        let body: String = (0..n).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.join("src/new.rs"), body).unwrap();
    }

    struct Fixture {
        repo: tempfile::TempDir,
        store_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = tempfile::tempdir().unwrap();
            init_repo(repo.path());
            Self {
                repo,
                store_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn store(&self) -> ProjectStore {
            ProjectStore::at(self.store_dir.path())
        }

        fn gate(&self, yaml: &str) -> Gate {
            Gate::new(parse_config(yaml).unwrap(), self.store())
                .with_reviewer(Arc::new(MockReviewer::new()))
        }

        fn event(&self, name: &str) -> HookEvent {
            HookEvent::new(name, self.repo.path()).with_session("s1")
        }

        fn session(&self) -> SessionState {
            session::load_or_default(&self.store(), "s1")
        }
    }

    const FAST_TESTS: &str = r#"
sources: ["src/**"]
hooks:
  Stop:
    - tasks:
        - name: fast-tests
          type: script
          command: "exit 1"
          when: { linesChanged: 5 }
"#;

    #[tokio::test]
    async fn failing_script_on_stop_records_first_failure() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 10);
        let gate = fx.gate(FAST_TESTS);

        let report = gate.run(&fx.event("Stop")).await.unwrap();
        assert!(report.blocked());
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].outcome.reason, "`exit 1` failed (exit 1)");
        assert_eq!(fx.session().failures("fast-tests"), 1);

        // Turn events keep the baseline on failure.
        let churn = ChurnStore::new(fx.repo.path(), &["src/**".to_string()]).unwrap();
        assert_eq!(churn.net_churn_since("fast-tests"), 10);
    }

    #[tokio::test]
    async fn below_threshold_skips_silently() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 3);
        let report = fx.gate(FAST_TESTS).run(&fx.event("Stop")).await.unwrap();
        assert!(!report.blocked());
        assert!(report.tasks.is_empty());
    }

    #[tokio::test]
    async fn passing_script_advances_and_resets() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 10);
        let gate = fx.gate(&FAST_TESTS.replace("exit 1", "true"));

        let mut state = SessionState::default();
        state.record_failure("fast-tests");
        session::save_session(&fx.store(), "s1", &state).unwrap();

        let report = gate.run(&fx.event("Stop")).await.unwrap();
        assert!(!report.blocked());
        assert_eq!(fx.session().failures("fast-tests"), 0);

        // Nothing changed since: the second run is not scheduled.
        let report = gate.run(&fx.event("Stop")).await.unwrap();
        assert!(report.tasks.is_empty());
    }

    #[tokio::test]
    async fn fifth_failure_offers_backchannel() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 10);
        let gate = fx.gate(FAST_TESTS);

        for n in 1..=4 {
            let report = gate.run(&fx.event("Stop")).await.unwrap();
            assert!(!report.tasks[0].outcome.reason.contains("## Appeal"), "run {n}");
        }
        let report = gate.run(&fx.event("Stop")).await.unwrap();
        assert!(report.tasks[0].outcome.reason.contains("## Appeal"));
        assert!(fx.store().backchannel_path("s1", "fast-tests").is_file());
    }

    #[tokio::test]
    async fn agent_task_uses_reviewer_verdict() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 2);
        let mock = Arc::new(MockReviewer::new());
        mock.answer("FAIL: missing tests\n\n### details\nmore text");
        let yaml = r#"
reviewer: { event_models: { Stop: sonnet } }
hooks:
  Stop:
    - tasks:
        - { name: review, type: agent, prompt: "Review {{task}}:\n{{diff}}" }
"#;
        let gate = fx.gate(yaml).with_reviewer(mock.clone());
        let report = gate.run(&fx.event("Stop")).await.unwrap();

        assert!(report.blocked());
        assert!(report.message().starts_with("[review] missing tests"));
        let reqs = mock.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].model.as_deref(), Some("sonnet"));
        assert!(reqs[0].prompt.starts_with("Review review:"));
        assert!(reqs[0].prompt.contains("+line 1"));
        // Agent failures on Turn events never count toward appeals.
        assert_eq!(fx.session().failures("review"), 0);
    }

    #[tokio::test]
    async fn configuration_error_is_boom_and_blocks() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - { name: review, type: agent, prompt: "builtin:nonsense" }
"#;
        let report = fx.gate(yaml).run(&fx.event("Stop")).await.unwrap();
        assert!(report.blocked());
        assert!(report.message().contains("unknown builtin prompt"));

        let log = std::fs::read_to_string(fx.store().log_path(Some("s1"))).unwrap();
        assert!(log.contains("\"BOOM\""));
    }

    #[tokio::test]
    async fn pre_tool_use_matcher_and_gate_advance() {
        let fx = Fixture::new();
        write_lines(fx.repo.path(), 10);
        let yaml = r#"
hooks:
  PreToolUse:
    - matcher: "^(Edit|Write)$"
      tasks:
        - { name: guard, type: script, command: "exit 2", when: { linesChanged: 1 } }
"#;
        let gate = fx.gate(yaml);
        let bash = fx.event("PreToolUse").with_tool("Bash", serde_json::json!({}));
        assert!(gate.run(&bash).await.unwrap().tasks.is_empty());

        let edit = fx.event("PreToolUse").with_tool("Edit", serde_json::json!({}));
        let report = gate.run(&edit).await.unwrap();
        assert!(report.blocked());

        // Gate events advance even on failure.
        let churn = ChurnStore::new(fx.repo.path(), &[]).unwrap();
        assert_eq!(churn.net_churn_since("guard"), 0);
    }

    #[tokio::test]
    async fn parallel_tasks_run_concurrently_and_report_in_order() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - name: waiter
          type: script
          parallel: true
          command: "for i in $(seq 100); do [ -f b.done ] && exit 0; sleep 0.1; done; exit 1"
        - name: toucher
          type: script
          parallel: true
          command: "touch b.done"
"#;
        let report = fx.gate(yaml).run(&fx.event("Stop")).await.unwrap();
        let names: Vec<&str> = report.tasks.iter().map(|t| t.task.as_str()).collect();
        assert_eq!(names, vec!["waiter", "toucher"]);
        assert!(!report.blocked(), "{}", report.message());
    }

    #[tokio::test]
    async fn background_task_is_collected_later() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - { name: slow, type: script, async: true, command: "exit 7" }
"#;
        let gate = fx.gate(yaml);
        let report = gate.run(&fx.event("Stop")).await.unwrap();
        assert!(!report.blocked());

        let mut collected = None;
        for _ in 0..100 {
            let report = gate.run(&fx.event("Notification")).await.unwrap();
            if let Some(t) = report.tasks.into_iter().find(|t| t.task == "slow") {
                collected = Some(t);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let collected = collected.expect("background result never collected");
        assert!(!collected.outcome.pass());
        assert!(collected.outcome.reason.contains("exit 7"));
    }

    async fn collect_job(gate: &Gate, fx: &Fixture, task: &str) -> TaskReport {
        for _ in 0..100 {
            let report = gate.run(&fx.event("Notification")).await.unwrap();
            if let Some(t) = report.tasks.into_iter().find(|t| t.task == task) {
                return t;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("background result for {task} never collected");
    }

    #[tokio::test]
    async fn background_failures_escalate_to_appeal() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - { name: slow, type: script, async: true, command: "exit 7" }
"#;
        let gate = fx.gate(yaml);
        for n in 1..=5u32 {
            gate.run(&fx.event("Stop")).await.unwrap();
            let collected = collect_job(&gate, &fx, "slow").await;
            assert!(!collected.outcome.pass());
            assert_eq!(fx.session().failures("slow"), n);
        }
        let channel = fx.store().backchannel_path("s1", "slow");
        assert!(channel.is_file());

        // A passing background run clears the streak and the backchannel.
        let gate = fx.gate(&yaml.replace("exit 7", "true"));
        gate.run(&fx.event("Stop")).await.unwrap();
        let collected = collect_job(&gate, &fx, "slow").await;
        assert!(collected.outcome.pass());
        assert_eq!(fx.session().failures("slow"), 0);
        assert!(!channel.exists());
    }

    #[tokio::test]
    async fn signal_task_runs_once_and_consumes_signal() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - { name: on-demand, type: script, command: "true", when: { signal: review } }
"#;
        let gate = fx.gate(yaml);
        assert!(gate.run(&fx.event("Stop")).await.unwrap().tasks.is_empty());

        let mut state = fx.session();
        state.raise_signal("review", "please");
        session::save_session(&fx.store(), "s1", &state).unwrap();

        assert_eq!(gate.run(&fx.event("Stop")).await.unwrap().tasks.len(), 1);
        assert!(fx.session().signal.is_none());
        assert!(gate.run(&fx.event("Stop")).await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn post_tool_use_feeds_gross_churn() {
        let fx = Fixture::new();
        let yaml = r#"
hooks:
  Stop:
    - tasks:
        - { name: written, type: script, command: "true", when: { linesWritten: 3 } }
"#;
        let gate = fx.gate(yaml);
        // Bootstrap the task's copy of the counter.
        assert!(gate.run(&fx.event("Stop")).await.unwrap().tasks.is_empty());

        let write = fx
            .event("PostToolUse")
            .with_tool("Write", serde_json::json!({"file_path": "x", "content": "1\n2\n3\n4\n"}));
        gate.run(&write).await.unwrap();
        assert_eq!(fx.session().lines_written, 4);
        assert_eq!(fx.session().turn_tools, vec!["Write".to_string()]);

        assert_eq!(gate.run(&fx.event("Stop")).await.unwrap().tasks.len(), 1);
    }

    #[test]
    fn report_message_lists_failures_only() {
        let mut report = GateReport::new("Stop");
        report.push("a", CheckOutcome::passed("", String::new(), Duration::ZERO));
        report.push("b", CheckOutcome::failed("broken", String::new(), Duration::ZERO));
        report.push("c", CheckOutcome::skipped("reviewer unavailable", Duration::ZERO));
        assert!(report.blocked());
        assert_eq!(report.message(), "[b] broken");
        assert_eq!(report.warnings(), vec!["[c] skipped: reviewer unavailable".to_string()]);
    }
}
