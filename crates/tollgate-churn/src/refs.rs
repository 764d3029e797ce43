//! Ref naming and compare-and-swap updates under `refs/tollgate/`.

use crate::git::Git;
use std::path::Path;

/// Every ref this crate owns lives below this prefix.
pub const NAMESPACE: &str = "refs/tollgate";

/// Global monotonic counter of lines written.
pub const GROSS_REF: &str = "refs/tollgate/gross";

/// Working-tree snapshot acknowledged by `task`.
pub fn snapshot_ref(task: &str) -> String {
    format!("{NAMESPACE}/snapshot/{}", ref_component(task))
}

/// The task's private copy of the gross counter.
pub fn gross_seen_ref(task: &str) -> String {
    format!("{NAMESPACE}/gross-seen/{}", ref_component(task))
}

/// Encode a task name as one ref path component.
///
/// Same injective encoding the store uses for its file names, so a task's
/// refs and its backchannel file always agree on identity.
pub fn ref_component(name: &str) -> String {
    tollgate_store::encode_component(name)
}

/// Object id the ref points at, without peeling. `None` if the ref is absent.
pub(crate) fn read_ref(root: &Path, name: &str) -> Option<String> {
    Git::new(root).text(&["rev-parse", "--verify", "-q", name])
}

/// Commit the ref points at. `None` if absent or not a usable commit.
pub(crate) fn read_commit(root: &Path, name: &str) -> Option<String> {
    let spec = format!("{name}^{{commit}}");
    Git::new(root).text(&["rev-parse", "--verify", "-q", &spec])
}

/// Atomically point `name` at `new`, provided it currently points at `old`
/// (`None` = the ref must not exist yet). Returns false on conflict or error.
pub(crate) fn compare_and_swap(root: &Path, name: &str, new: &str, old: Option<&str>) -> bool {
    Git::new(root).ok(&[
        "update-ref",
        "-m",
        "tollgate",
        name,
        new,
        old.unwrap_or(""),
    ])
}

/// All refs under [`NAMESPACE`].
pub(crate) fn list_owned(root: &Path) -> Vec<String> {
    let prefix = format!("{NAMESPACE}/");
    Git::new(root)
        .text(&["for-each-ref", "--format=%(refname)", &prefix])
        .map(|out| {
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn delete(root: &Path, name: &str) -> bool {
    Git::new(root).ok(&["update-ref", "-d", name])
}
