use serde::Serialize;
use std::path::Path;
use tollgate_churn::ChurnStore;
use tollgate_gate::config::GateConfig;
use tollgate_gate::event_log::{last_results, read_entries, LogEntry};
use tollgate_gate::session::{load_session, SessionState};
use tollgate_gate::load_config;
use tollgate_store::ProjectStore;

#[derive(Debug, Serialize)]
struct TaskStatus {
    event: String,
    task: String,
    /// `None` until the task first acknowledges the tree.
    net: Option<u64>,
    gross: Option<u64>,
    failures: u32,
    suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last: Option<LogEntry>,
}

/// `tollgate status`
pub fn execute(repo_root: &Path, session: Option<&str>, json: bool) -> anyhow::Result<()> {
    let Some(config) = load_config(repo_root)? else {
        println!("No .tollgate.yml in {}", repo_root.display());
        return Ok(());
    };
    let store = ProjectStore::for_project(repo_root);
    let state = match session {
        Some(sid) => load_session(&store, sid)?.unwrap_or_default(),
        None => SessionState::default(),
    };
    let entries = read_entries(&store.log_path(session));
    let churn = ChurnStore::new(repo_root, &config.sources)?;
    let rows = collect(&config, &churn, &state, &entries);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if !churn.is_repo() {
        println!("Not a git working tree: churn is not tracked");
    }
    if let Some(signal) = &state.signal {
        println!("Pending signal: {} {}", signal.kind, signal.message);
    }
    if rows.is_empty() {
        println!("No tasks configured");
        return Ok(());
    }
    for row in &rows {
        let count = |v: Option<u64>| v.map_or("-".to_string(), |n| n.to_string());
        let mut line = format!(
            "{:<12} {:<24} net {:>6}  gross {:>6}",
            row.event,
            row.task,
            count(row.net),
            count(row.gross)
        );
        if row.failures > 0 {
            line.push_str(&format!("  failures {}", row.failures));
        }
        if row.suspended {
            line.push_str("  suspended");
        }
        if let Some(last) = &row.last {
            line.push_str(&format!("  last {} at {}", last.status.as_str(), last.ts));
        }
        println!("{line}");
    }
    Ok(())
}

fn collect(
    config: &GateConfig,
    churn: &ChurnStore,
    state: &SessionState,
    entries: &[LogEntry],
) -> Vec<TaskStatus> {
    let mut last = last_results(entries);
    config
        .all_tasks()
        .map(|(event, task)| {
            // Read-only: never bootstrap a task's refs from here.
            let tracked = churn.tracks(&task.name);
            TaskStatus {
                event: event.to_string(),
                task: task.name.clone(),
                net: tracked.then(|| churn.net_churn_since(&task.name)),
                gross: churn.peek_gross_churn(&task.name),
                failures: state.failures(&task.name),
                suspended: state.is_suspended(&task.name),
                last: last.remove(&task.name),
            }
        })
        .collect()
}
