use serde_json::json;
use std::io::Read;
use tollgate_gate::{load_config, recursion_guarded, Gate, GateReport, HookEvent};
use tollgate_store::ProjectStore;

/// What the hook hands back to the host.
#[derive(Debug, Default, PartialEq)]
pub struct HookResponse {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
}

/// `tollgate hook`: read the payload from stdin, gate, answer the host
pub fn execute(event_override: Option<&str>) -> anyhow::Result<()> {
    let mut stdin_buf = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut stdin_buf) {
        tracing::warn!(error = %e, "cannot read hook payload");
        return Ok(());
    }

    let response = match dispatch(&stdin_buf, event_override) {
        Ok(response) => response,
        Err(e) => {
            // Internal errors never block the host.
            tracing::warn!(error = %format!("{e:#}"), "hook failed, letting the host proceed");
            return Ok(());
        }
    };
    if let Some(out) = &response.stdout {
        print!("{out}");
    }
    if let Some(err) = &response.stderr {
        eprintln!("{err}");
    }
    if response.exit_code != 0 {
        std::process::exit(response.exit_code);
    }
    Ok(())
}

fn dispatch(stdin: &str, event_override: Option<&str>) -> anyhow::Result<HookResponse> {
    if recursion_guarded() {
        return Ok(HookResponse::default());
    }
    let event = HookEvent::from_payload(stdin, event_override)?;
    let config = match load_config(&event.cwd) {
        Ok(Some(config)) => config,
        Ok(None) => return Ok(HookResponse::default()),
        Err(e) => {
            let reason = format!("tollgate configuration error: {e:#}");
            return Ok(block(&event.name, &reason));
        }
    };

    let store = ProjectStore::for_project(&event.cwd);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = rt.block_on(Gate::new(config, store).run(&event))?;
    Ok(render(&report))
}

/// Render a gate report in the host's hook protocol.
pub fn render(report: &GateReport) -> HookResponse {
    if report.blocked() {
        return block(&report.event, &report.message());
    }
    let warnings = report.warnings();
    HookResponse {
        stdout: None,
        stderr: (!warnings.is_empty()).then(|| warnings.join("\n")),
        exit_code: 0,
    }
}

fn block(event: &str, reason: &str) -> HookResponse {
    match event {
        "Stop" | "SubagentStop" => HookResponse {
            stdout: Some(json!({ "decision": "block", "reason": reason }).to_string()),
            stderr: None,
            exit_code: 0,
        },
        "PreToolUse" => HookResponse {
            stdout: Some(
                json!({
                    "hookSpecificOutput": {
                        "hookEventName": "PreToolUse",
                        "permissionDecision": "deny",
                        "permissionDecisionReason": reason,
                    }
                })
                .to_string(),
            ),
            stderr: None,
            exit_code: 0,
        },
        // git pre-commit: any non-zero exit aborts the commit
        "PreCommit" => HookResponse {
            stdout: None,
            stderr: Some(reason.to_string()),
            exit_code: 1,
        },
        // Exit 2 = blocking error; the host feeds stderr back to the model
        _ => HookResponse {
            stdout: None,
            stderr: Some(reason.to_string()),
            exit_code: 2,
        },
    }
}
