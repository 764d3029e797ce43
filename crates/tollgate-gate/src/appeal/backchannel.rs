//! The backchannel file: where the developer can argue that a repeatedly
//! failing check should be set aside.
//!
//! ```text
//! # Appeal: <task>
//! <!-- tollgate:context:start -->
//! ...latest failure, rewritten on every refresh...
//! <!-- tollgate:context:end -->
//!
//! ## Appeal
//! <!-- placeholder -->
//! ...developer text, never touched by the gate...
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tollgate_store::ProjectStore;

const CONTEXT_START: &str = "<!-- tollgate:context:start -->";
const CONTEXT_END: &str = "<!-- tollgate:context:end -->";
const APPEAL_HEADING: &str = "## Appeal";
const APPEAL_PLACEHOLDER: &str =
    "<!-- Explain below why this check should be set aside for the rest of the session. Leave empty to keep fixing. -->";

/// Failure details rendered into the context section.
pub struct FailureContext<'a> {
    pub task: &'a str,
    pub command: &'a str,
    pub failures: u32,
    pub reason: &'a str,
}

impl FailureContext<'_> {
    fn render(&self) -> String {
        format!(
            "{CONTEXT_START}\n\
             Task `{}` has failed {} times in a row.\n\n\
             Command: `{}`\n\n\
             Latest failure:\n\n```\n{}\n```\n\
             {CONTEXT_END}",
            self.task,
            self.failures,
            self.command,
            self.reason.trim()
        )
    }
}

pub struct Backchannel {
    path: PathBuf,
}

impl Backchannel {
    pub fn new(store: &ProjectStore, session_id: &str, task: &str) -> Self {
        Self {
            path: store.backchannel_path(session_id, task),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create the file unless it already exists. Returns whether it was created;
    /// an existing file is never overwritten.
    pub fn create(&self, ctx: &FailureContext<'_>) -> io::Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        write!(
            file,
            "# Appeal: {}\n\n{}\n\n{APPEAL_HEADING}\n\n{APPEAL_PLACEHOLDER}\n\n",
            ctx.task,
            ctx.render()
        )?;
        Ok(true)
    }

    /// Rewrite only the context section. Everything outside the markers,
    /// including the appeal text, is kept byte for byte. A file whose markers
    /// were removed is left alone.
    pub fn refresh_context(&self, ctx: &FailureContext<'_>) -> io::Result<bool> {
        let content = fs::read_to_string(&self.path)?;
        let (Some(start), Some(end)) = (content.find(CONTEXT_START), content.find(CONTEXT_END)) else {
            return Ok(false);
        };
        if end < start {
            return Ok(false);
        }
        let mut updated = String::with_capacity(content.len());
        updated.push_str(&content[..start]);
        updated.push_str(&ctx.render());
        updated.push_str(&content[end + CONTEXT_END.len()..]);
        if updated != content {
            tollgate_store::write_atomic(&self.path, updated.as_bytes())
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(true)
    }

    /// Developer-written appeal text, if any.
    pub fn appeal_text(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        let from = content
            .find(CONTEXT_END)
            .map(|end| end + CONTEXT_END.len())
            .unwrap_or(0);
        let pos = from + content[from..].find(APPEAL_HEADING)?;
        let after = &content[pos + APPEAL_HEADING.len()..];
        let text = after.replace(APPEAL_PLACEHOLDER, "");
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// Delete the file and, if now empty, its session directory.
    pub fn remove(&self) -> bool {
        let removed = fs::remove_file(&self.path).is_ok();
        if removed {
            if let Some(parent) = self.path.parent() {
                let _ = fs::remove_dir(parent);
            }
        }
        removed
    }
}
