//! Churn tracking for tollgate.
//!
//! Measures how much source changed since a task last acknowledged the tree,
//! using git's object store as the only persistence:
//!
//! - **net churn**: added + removed lines between the task's snapshot ref and
//!   the working tree (tracked, staged, unstaged and untracked source files);
//! - **gross churn**: growth of a global counter blob since the task's private
//!   copy of it. The counter only increases, so reverts still count.
//!
//! Nothing here is fatal. Any git failure reads as "no information" (0 / no-op)
//! so a broken repo never wedges the gate.

mod counter;
mod git;
pub mod refs;
mod snapshot;

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

/// Matches repo-relative paths against configured source globs.
/// An empty glob list matches every path.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    set: Option<GlobSet>,
}

impl SourceFilter {
    pub fn new(globs: &[String]) -> anyhow::Result<Self> {
        if globs.is_empty() {
            return Ok(Self { set: None });
        }
        let mut builder = GlobSetBuilder::new();
        for g in globs {
            let glob = Glob::new(g).map_err(|e| anyhow::anyhow!("invalid source glob {g:?}: {e}"))?;
            builder.add(glob);
        }
        Ok(Self {
            set: Some(builder.build()?),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.set {
            Some(set) => set.is_match(path),
            None => true,
        }
    }
}

/// Handle on one working tree's churn state.
#[derive(Debug, Clone)]
pub struct ChurnStore {
    root: PathBuf,
    sources: SourceFilter,
}

impl ChurnStore {
    pub fn new(root: impl Into<PathBuf>, source_globs: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            root: root.into(),
            sources: SourceFilter::new(source_globs)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `root` is inside a git working tree.
    pub fn is_repo(&self) -> bool {
        git::is_work_tree(&self.root)
    }

    /// Whether `task` has acknowledged a snapshot yet. Read-only, unlike
    /// [`ChurnStore::net_churn_since`] which bootstraps the ref.
    pub fn tracks(&self, task: &str) -> bool {
        refs::read_ref(&self.root, &refs::snapshot_ref(task)).is_some()
    }

    /// Remove every ref under [`refs::NAMESPACE`]. Returns how many were deleted.
    pub fn delete_all(&self) -> usize {
        let mut deleted = 0;
        for name in refs::list_owned(&self.root) {
            if refs::delete(&self.root, &name) {
                deleted += 1;
            } else {
                tracing::warn!(%name, "failed to delete ref");
            }
        }
        deleted
    }
}
