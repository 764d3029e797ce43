use crate::check::RunEnv;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// One request to an external reviewer model.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: RunEnv,
}

/// How a reviewer invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Completed { output: String },
    /// The reviewer binary is not installed or not reachable.
    Unavailable { reason: String },
    Crashed { error: String },
    TimedOut,
}

/// Runs review prompts. Implemented by [`ClaudeReviewer`] and, for tests,
/// [`MockReviewer`].
#[async_trait::async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> ReviewOutcome;
}

/// Sends the prompt on stdin to `<bin> -p [--model M]` and reads the answer
/// from stdout.
pub struct ClaudeReviewer {
    pub bin: PathBuf,
}

impl Default for ClaudeReviewer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeReviewer {
    pub fn new() -> Self {
        Self::with_bin(PathBuf::from("claude"))
    }

    pub fn with_bin(bin: PathBuf) -> Self {
        Self { bin }
    }
}

#[async_trait::async_trait]
impl Reviewer for ClaudeReviewer {
    async fn review(&self, request: &ReviewRequest) -> ReviewOutcome {
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("-p");
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Allow nesting inside a host agent session.
            .env_remove("CLAUDE_CODE")
            .env_remove("CLAUDECODE");
        for (k, v) in request.env.vars() {
            cmd.env(k, v);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ReviewOutcome::Unavailable {
                    reason: format!("{} not found", self.bin.display()),
                }
            }
            Err(e) => {
                return ReviewOutcome::Crashed {
                    error: format!("spawn error: {e}"),
                }
            }
        };

        let prompt = request.prompt.clone();
        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(request.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => ReviewOutcome::Completed {
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            },
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ReviewOutcome::Crashed {
                    error: format!(
                        "exit {}: {}",
                        output.status.code().unwrap_or(-1),
                        crate::check::tail(&crate::check::mask_secrets(&stderr), 10, 1000)
                    ),
                }
            }
            Ok(Err(e)) => ReviewOutcome::Crashed {
                error: format!("i/o error: {e}"),
            },
            Err(_) => ReviewOutcome::TimedOut,
        }
    }
}

/// Mock reviewer for testing. Pops queued outcomes in order and records
/// every request. When the queue is empty the reviewer reports itself
/// unavailable.
#[derive(Default)]
pub struct MockReviewer {
    outcomes: Mutex<VecDeque<ReviewOutcome>>,
    requests: Mutex<Vec<ReviewRequest>>,
}

impl MockReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(outcomes: impl IntoIterator<Item = ReviewOutcome>) -> Self {
        let mock = Self::new();
        for o in outcomes {
            mock.push(o);
        }
        mock
    }

    pub fn push(&self, outcome: ReviewOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Queue a completed review with `output`.
    pub fn answer(&self, output: &str) {
        self.push(ReviewOutcome::Completed {
            output: output.to_string(),
        });
    }

    pub fn requests(&self) -> Vec<ReviewRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Reviewer for MockReviewer {
    async fn review(&self, request: &ReviewRequest) -> ReviewOutcome {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| ReviewOutcome::Unavailable {
                reason: "mock reviewer has no queued outcome".into(),
            })
    }
}
