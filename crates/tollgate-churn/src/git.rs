//! Thin wrapper over the `git` CLI.
//!
//! Every call returns `Option`: a spawn failure, a non-zero exit or a
//! non-UTF-8 answer all collapse to `None`, which callers treat as
//! "no information".

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Identity used for snapshot commits, so `commit-tree` works in repos
/// without `user.name` / `user.email`.
const SNAPSHOT_IDENT: (&str, &str) = ("tollgate", "tollgate@localhost");

/// Builder for one git invocation rooted at a working tree.
pub(crate) struct Git<'a> {
    root: &'a Path,
    index: Option<&'a Path>,
    input: Option<&'a [u8]>,
    identity: bool,
}

impl<'a> Git<'a> {
    pub(crate) fn new(root: &'a Path) -> Self {
        Self {
            root,
            index: None,
            input: None,
            identity: false,
        }
    }

    /// Run against an alternate index file (`GIT_INDEX_FILE`).
    pub(crate) fn index(mut self, index: &'a Path) -> Self {
        self.index = Some(index);
        self
    }

    /// Feed bytes on stdin.
    pub(crate) fn stdin(mut self, input: &'a [u8]) -> Self {
        self.input = Some(input);
        self
    }

    /// Pin author/committer identity.
    pub(crate) fn with_identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Raw stdout of a successful invocation.
    pub(crate) fn output(&self, args: &[&str]) -> Option<Vec<u8>> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(index) = self.index {
            cmd.env("GIT_INDEX_FILE", index);
        }
        if self.identity {
            let (name, email) = SNAPSHOT_IDENT;
            cmd.env("GIT_AUTHOR_NAME", name)
                .env("GIT_AUTHOR_EMAIL", email)
                .env("GIT_COMMITTER_NAME", name)
                .env("GIT_COMMITTER_EMAIL", email);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(error = %e, "git not available");
                return None;
            }
        };
        if let (Some(input), Some(mut stdin)) = (self.input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input) {
                tracing::debug!(error = %e, ?args, "failed to write git stdin");
            }
        }
        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(error = %e, ?args, "git did not finish");
                return None;
            }
        };
        if !output.status.success() {
            tracing::debug!(
                ?args,
                code = output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git failed"
            );
            return None;
        }
        Some(output.stdout)
    }

    /// Stdout as a string with the trailing newline removed.
    pub(crate) fn text(&self, args: &[&str]) -> Option<String> {
        let out = self.output(args)?;
        let s = String::from_utf8(out).ok()?;
        Some(s.trim_end().to_string())
    }

    /// Whether the invocation exited 0.
    pub(crate) fn ok(&self, args: &[&str]) -> bool {
        self.output(args).is_some()
    }
}

pub(crate) fn is_work_tree(root: &Path) -> bool {
    Git::new(root)
        .text(&["rev-parse", "--is-inside-work-tree"])
        .is_some_and(|s| s == "true")
}

/// Current `HEAD` commit, `None` on an unborn branch or outside a repo.
pub(crate) fn head(root: &Path) -> Option<String> {
    Git::new(root).text(&["rev-parse", "--verify", "-q", "HEAD^{commit}"])
}

/// Path of the index git would use right now, honouring an inherited
/// `GIT_INDEX_FILE` (set inside git hooks such as pre-commit).
fn live_index_path(root: &Path) -> Option<PathBuf> {
    if let Some(from_env) = std::env::var_os("GIT_INDEX_FILE").filter(|v| !v.is_empty()) {
        let p = PathBuf::from(from_env);
        return Some(if p.is_absolute() { p } else { root.join(p) });
    }
    let rel = Git::new(root).text(&["rev-parse", "--git-path", "index"])?;
    let p = PathBuf::from(rel);
    Some(if p.is_absolute() { p } else { root.join(p) })
}

// ── Scratch index ──

/// A private copy of the live index inside the git dir.
///
/// Registering untracked files (`add -N`, `add`) happens here, so the caller's
/// index and working tree are never touched. The file is removed on drop.
pub(crate) struct ScratchIndex {
    file: tempfile::NamedTempFile,
}

impl ScratchIndex {
    pub(crate) fn prepare(root: &Path) -> Option<Self> {
        let git_dir = Git::new(root).text(&["rev-parse", "--absolute-git-dir"])?;
        let file = tempfile::Builder::new()
            .prefix("tollgate-index-")
            .tempfile_in(&git_dir)
            .map_err(|e| tracing::debug!(error = %e, "cannot create scratch index"))
            .ok()?;
        match live_index_path(root) {
            Some(live) if live.is_file() => {
                if let Err(e) = std::fs::copy(&live, file.path()) {
                    tracing::debug!(error = %e, "cannot copy index");
                    return None;
                }
            }
            // No index yet (fresh repo): git treats an empty file as invalid,
            // so remove it and let git create one on first write.
            _ => {
                let _ = std::fs::remove_file(file.path());
            }
        }
        Some(Self { file })
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }
}
