//! Working-tree snapshots and net churn.

use crate::git::{self, Git, ScratchIndex};
use crate::refs;
use crate::{ChurnStore, SourceFilter};
use std::path::{Path, PathBuf};

const SNAPSHOT_MESSAGE: &str = "tollgate snapshot";

impl ChurnStore {
    /// Top of the working tree; all path-sensitive plumbing runs from here.
    fn work_root(&self) -> Option<PathBuf> {
        Git::new(&self.root)
            .text(&["rev-parse", "--show-toplevel"])
            .map(PathBuf::from)
    }

    /// Capture tracked, staged, unstaged and untracked source files as one commit id.
    ///
    /// Runs against a scratch index so the caller's index and working tree are
    /// unchanged afterwards. A tree identical to `HEAD` returns `HEAD` itself.
    pub fn snapshot(&self) -> Option<String> {
        let top = self.work_root()?;
        let index = ScratchIndex::prepare(&top)?;
        if !Git::new(&top).index(index.path()).ok(&["add", "-u"]) {
            return None;
        }
        let untracked = untracked_sources(&top, index.path(), &self.sources);
        if !untracked.is_empty() && !register(&top, index.path(), &untracked, false) {
            return None;
        }
        let tree = Git::new(&top).index(index.path()).text(&["write-tree"])?;

        let head = git::head(&top);
        if let Some(head) = &head {
            let head_tree = Git::new(&top).text(&["rev-parse", &format!("{head}^{{tree}}")]);
            if head_tree.as_deref() == Some(tree.as_str()) {
                return Some(head.clone());
            }
        }

        let mut args = vec!["commit-tree", tree.as_str(), "-m", SNAPSHOT_MESSAGE];
        if let Some(head) = &head {
            args.push("-p");
            args.push(head);
        }
        Git::new(&top).with_identity().text(&args)
    }

    /// Lines added + removed in source files since `task`'s snapshot.
    ///
    /// A task seen for the first time is bootstrapped to `HEAD`, so edits that
    /// are already in flight count immediately. Outside a repo, or with a ref
    /// that no longer resolves to a commit, the answer is 0.
    pub fn net_churn_since(&self, task: &str) -> u64 {
        let Some(top) = self.work_root() else {
            return 0;
        };
        let name = refs::snapshot_ref(task);
        let base = if refs::read_ref(&top, &name).is_some() {
            match refs::read_commit(&top, &name) {
                Some(commit) => commit,
                None => {
                    tracing::warn!(%name, "snapshot ref does not resolve to a commit");
                    return 0;
                }
            }
        } else {
            match bootstrap(&top, &name) {
                Some(commit) => commit,
                None => return 0,
            }
        };
        numstat_against(&top, &base, &self.sources).unwrap_or(0)
    }

    /// Move `task`'s snapshot ref to the current tree. The only way net churn resets.
    ///
    /// The ref is swapped against the value read just before, so a concurrent
    /// advance wins cleanly instead of being clobbered. Returns true when the
    /// ref ends up at a fresh snapshot.
    pub fn advance_snapshot(&self, task: &str) -> bool {
        let Some(id) = self.snapshot() else {
            return false;
        };
        let name = refs::snapshot_ref(task);
        let old = refs::read_ref(&self.root, &name);
        if old.as_deref() == Some(id.as_str()) {
            return true;
        }
        let swapped = refs::compare_and_swap(&self.root, &name, &id, old.as_deref());
        if !swapped {
            tracing::debug!(%name, "snapshot advanced concurrently; keeping the other value");
        }
        swapped
    }

    /// Unified diff of source files since `task`'s snapshot (or `HEAD` if it has none).
    pub fn diff_since(&self, task: &str) -> Option<String> {
        let top = self.work_root()?;
        let base = refs::read_commit(&top, &refs::snapshot_ref(task)).or_else(|| git::head(&top))?;
        let index = ScratchIndex::prepare(&top)?;
        let untracked = untracked_sources(&top, index.path(), &self.sources);
        if !untracked.is_empty() && !register(&top, index.path(), &untracked, true) {
            return None;
        }
        // Pick paths with the same matcher churn uses, then hand git literal paths.
        let names = Git::new(&top).index(index.path()).output(&[
            "diff",
            "--name-only",
            "--no-renames",
            "-z",
            base.as_str(),
        ])?;
        let paths: Vec<&str> = names
            .split(|b| *b == 0)
            .filter(|p| !p.is_empty())
            .filter_map(|p| std::str::from_utf8(p).ok())
            .filter(|p| self.sources.matches(p))
            .collect();
        if paths.is_empty() {
            return Some(String::new());
        }
        let mut args = vec![
            "--literal-pathspecs",
            "diff",
            "--no-renames",
            "--no-color",
            base.as_str(),
            "--",
        ];
        args.extend(paths.iter().copied());
        Git::new(&top).index(index.path()).text(&args)
    }
}

/// Point a missing snapshot ref at `HEAD`. If another process got there
/// first, use its value.
fn bootstrap(top: &Path, name: &str) -> Option<String> {
    let head = git::head(top)?;
    if refs::compare_and_swap(top, name, &head, None) {
        tracing::debug!(%name, %head, "bootstrapped snapshot ref");
        Some(head)
    } else {
        refs::read_commit(top, name)
    }
}

/// Untracked, non-ignored files that match the source filter.
fn untracked_sources(top: &Path, index: &Path, sources: &SourceFilter) -> Vec<String> {
    let Some(out) = Git::new(top)
        .index(index)
        .output(&["ls-files", "-z", "--others", "--exclude-standard"])
    else {
        return Vec::new();
    };
    out.split(|b| *b == 0)
        .filter(|p| !p.is_empty())
        .filter_map(|p| std::str::from_utf8(p).ok())
        .filter(|p| sources.matches(p))
        .map(String::from)
        .collect()
}

/// Add `files` to the scratch index, as intent-to-add entries when `intent_only`.
fn register(top: &Path, index: &Path, files: &[String], intent_only: bool) -> bool {
    let mut list = Vec::new();
    for f in files {
        list.extend_from_slice(f.as_bytes());
        list.push(0);
    }
    let mut args = vec!["--literal-pathspecs", "add"];
    if intent_only {
        args.push("-N");
    }
    args.extend(["--pathspec-from-file=-", "--pathspec-file-nul"]);
    Git::new(top).index(index).stdin(&list).ok(&args)
}

/// Diff `base` against the working tree, counting untracked sources as added.
fn numstat_against(top: &Path, base: &str, sources: &SourceFilter) -> Option<u64> {
    let index = ScratchIndex::prepare(top)?;
    let untracked = untracked_sources(top, index.path(), sources);
    if !untracked.is_empty() && !register(top, index.path(), &untracked, true) {
        return None;
    }
    let out = Git::new(top)
        .index(index.path())
        .output(&["diff", "--numstat", "--no-renames", "-z", base])?;
    Some(sum_numstat(&out, sources))
}

/// Sum `added\tremoved\tpath\0` records for matching paths. Binary files (`-`) count 0.
fn sum_numstat(out: &[u8], sources: &SourceFilter) -> u64 {
    let text = String::from_utf8_lossy(out);
    text.split('\0')
        .filter(|rec| !rec.trim().is_empty())
        .filter_map(|rec| {
            let mut parts = rec.trim_start_matches('\n').splitn(3, '\t');
            let added = parts.next()?;
            let removed = parts.next()?;
            let path = parts.next()?;
            if !sources.matches(path) {
                return None;
            }
            let n = |s: &str| s.parse::<u64>().unwrap_or(0);
            Some(n(added) + n(removed))
        })
        .sum()
}
