use crate::check::{mask_secrets, tail, CheckOutcome, RunEnv};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Lines of output quoted in a failure reason.
const REASON_TAIL_LINES: usize = 30;
const REASON_TAIL_CHARS: usize = 2000;

/// Shell invocation with stderr folded into stdout, so the captured output
/// interleaves the way a terminal would show it.
fn shell_cmd(cmd: &str) -> (&'static str, Vec<String>) {
    ("sh", vec!["-c".into(), format!("exec 2>&1\n{cmd}")])
}

/// Run a script task: exit 0 passes, anything else fails.
pub async fn run_script(cmd: &str, cwd: &Path, timeout: Duration, env: &RunEnv) -> CheckOutcome {
    let start = Instant::now();
    let (shell, args) = shell_cmd(cmd);

    let mut command = Command::new(shell);
    command
        .args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in env.vars() {
        command.env(k, v);
    }

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => {
            let text = mask_secrets(&String::from_utf8_lossy(&output.stdout));
            if output.status.success() {
                return CheckOutcome::passed("", text, start.elapsed());
            }
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            let quoted = tail(&text, REASON_TAIL_LINES, REASON_TAIL_CHARS);
            let reason = if quoted.is_empty() {
                format!("`{cmd}` failed (exit {code})")
            } else {
                format!("`{cmd}` failed (exit {code}):\n{quoted}")
            };
            CheckOutcome::failed(reason, text, start.elapsed())
        }
        Ok(Err(e)) => CheckOutcome::failed(
            format!("`{cmd}` could not be started: {e}"),
            String::new(),
            start.elapsed(),
        ),
        Err(_) => CheckOutcome::failed(
            format!("`{cmd}` timed out after {}s", timeout.as_secs()),
            String::new(),
            start.elapsed(),
        ),
    }
}
