//! Detached (async) script tasks.
//!
//! The gate starts the command under a `sh` wrapper that outlives the hook
//! process and returns at once. The wrapper writes the combined output and,
//! last, the exit status into the job directory:
//!
//! ```text
//! jobs/<ulid>/job.json
//! jobs/<ulid>/output
//! jobs/<ulid>/status      (exit code, or `timeout`; appears last)
//! ```
//!
//! The wrapper leads its own process group. A watchdog signals the group when
//! the task's timeout elapses; the wrapper then records `timeout` and kills
//! whatever is left. Later invocations for the same session collect finished
//! jobs.

use crate::check::{mask_secrets, tail, CheckOutcome, RunEnv};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tollgate_store::ProjectStore;

/// Wrapper script. `$1` is the command, `$2` the job directory, `$3` the
/// timeout in seconds.
const WRAPPER: &str = r#"
timed_out=
trap 'timed_out=1' TERM
sh -c "$1" > "$2/output" 2>&1 &
cmd=$!
(sleep "$3"; kill -TERM 0) &
dog=$!
wait "$cmd"
code=$?
if [ -n "$timed_out" ]; then
  code=timeout
else
  kill "$dog" 2>/dev/null
fi
echo "$code" > "$2/status.tmp"
mv "$2/status.tmp" "$2/status"
if [ -n "$timed_out" ]; then kill -KILL 0; fi
"#;

/// Status the wrapper records when the watchdog fired.
const TIMED_OUT: &str = "timeout";

/// Extra time past the task's timeout before an unfinished job is written off.
const STALE_GRACE: Duration = Duration::from_secs(60);

/// Runtime past the timeout tolerated before a finished job counts as timed out.
const OVERRUN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetachedJob {
    pub id: String,
    pub task: String,
    pub event: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub command: String,
    pub started_at: String,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub job: DetachedJob,
    pub outcome: CheckOutcome,
}

impl DetachedJob {
    pub fn new(task: &str, event: &str, session_id: Option<&str>, command: &str, timeout: Duration) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            task: task.to_string(),
            event: event.to_string(),
            session_id: session_id.map(String::from),
            command: command.to_string(),
            started_at: crate::event::now_rfc3339(),
            timeout_sec: timeout.as_secs(),
        }
    }
}

/// Start the job's command in the background and record the job.
pub fn spawn(store: &ProjectStore, job: DetachedJob, cwd: &Path, env: &RunEnv) -> Result<DetachedJob> {
    let task = job.task.as_str();
    let dir = store.jobs_dir().join(&job.id);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let data = serde_json::to_string_pretty(&job)?;
    tollgate_store::write_atomic(&dir.join("job.json"), data.as_bytes())?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(WRAPPER)
        .arg("tollgate-job")
        .arg(&job.command)
        .arg(&dir)
        .arg(job.timeout_sec.max(1).to_string())
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (k, v) in env.vars() {
        cmd.env(k, v);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: the host's signals to the hook don't reach the
        // job, and the watchdog's don't reach the hook.
        cmd.process_group(0);
    }
    cmd.spawn()
        .with_context(|| format!("starting background task `{task}`"))?;
    tracing::debug!(task, id = %job.id, "background task started");
    Ok(job)
}

/// Collect finished (or stale) jobs belonging to `session_id`, removing
/// their directories. Jobs still running are left alone.
pub fn collect(store: &ProjectStore, session_id: Option<&str>) -> Vec<FinishedJob> {
    let Ok(entries) = fs::read_dir(store.jobs_dir()) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    // ULIDs sort by creation time.
    dirs.sort();

    let mut finished = Vec::new();
    for dir in dirs {
        let job: DetachedJob = match fs::read_to_string(dir.join("job.json"))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(job) => job,
            None => continue,
        };
        if job.session_id.as_deref() != session_id {
            continue;
        }
        let Some(outcome) = job_outcome(&dir, &job) else {
            continue;
        };
        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot remove finished job");
            continue;
        }
        finished.push(FinishedJob { job, outcome });
    }
    finished
}

fn job_outcome(dir: &Path, job: &DetachedJob) -> Option<CheckOutcome> {
    let age = job_age(job);
    let limit = Duration::from_secs(job.timeout_sec);
    let status_path = dir.join("status");
    let Ok(status) = fs::read_to_string(&status_path) else {
        return (age > limit + STALE_GRACE).then(|| {
            CheckOutcome::failed(
                format!(
                    "background `{}` did not finish within {}s",
                    job.command, job.timeout_sec
                ),
                String::new(),
                age,
            )
        });
    };
    let output = mask_secrets(&fs::read_to_string(dir.join("output")).unwrap_or_default());
    let runtime = job_runtime(&status_path, job).unwrap_or(age);
    let status = status.trim();
    if status == TIMED_OUT || runtime > limit + OVERRUN_SLACK {
        let quoted = tail(&output, 30, 2000);
        return Some(CheckOutcome::failed(
            format!(
                "background `{}` timed out after {}s:\n{quoted}",
                job.command, job.timeout_sec
            ),
            output,
            runtime,
        ));
    }
    Some(match status.parse::<i32>() {
        Ok(0) => CheckOutcome::passed("", output, runtime),
        Ok(code) => {
            let quoted = tail(&output, 30, 2000);
            CheckOutcome::failed(
                format!("background `{}` failed (exit {code}):\n{quoted}", job.command),
                output,
                runtime,
            )
        }
        Err(_) => CheckOutcome::failed(
            format!("background `{}` left an unreadable status", job.command),
            output,
            runtime,
        ),
    })
}

fn started(job: &DetachedJob) -> Option<time::OffsetDateTime> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::parse(&job.started_at, &Rfc3339).ok()
}

fn job_age(job: &DetachedJob) -> Duration {
    let Some(started) = started(job) else {
        return Duration::ZERO;
    };
    let elapsed = time::OffsetDateTime::now_utc() - started;
    Duration::try_from(elapsed).unwrap_or(Duration::ZERO)
}

/// Start to status-file write.
fn job_runtime(status: &Path, job: &DetachedJob) -> Option<Duration> {
    let finished = time::OffsetDateTime::from(fs::metadata(status).ok()?.modified().ok()?);
    Duration::try_from(finished - started(job)?).ok()
}
