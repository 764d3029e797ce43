//! Gross churn: a global lines-written counter stored as a blob behind a ref.
//!
//! Writers never lock. Each increment reads the ref, writes a new blob and
//! compare-and-swaps the ref against the id it read. Under contention a
//! writer retries a bounded number of times and then drops its delta, so the
//! counter can under-count but never over-count.

use crate::git::Git;
use crate::refs::{self, GROSS_REF};
use crate::ChurnStore;
use std::path::Path;

/// Read-write-swap attempts per increment before the delta is dropped.
const CAS_ATTEMPTS: usize = 3;

impl ChurnStore {
    /// Add `delta` lines to the global counter. Non-positive deltas are ignored.
    /// Returns true when the increment landed.
    pub fn increment_gross(&self, delta: i64) -> bool {
        if delta <= 0 || !self.is_repo() {
            return false;
        }
        let delta = delta as u64;
        for attempt in 1..=CAS_ATTEMPTS {
            let (old, value) = match read_counter(&self.root, GROSS_REF) {
                Some((oid, value)) => (Some(oid), value),
                None => (None, 0),
            };
            let Some(blob) = write_value(&self.root, value.saturating_add(delta)) else {
                return false;
            };
            if refs::compare_and_swap(&self.root, GROSS_REF, &blob, old.as_deref()) {
                return true;
            }
            tracing::debug!(attempt, "gross counter changed underneath us, retrying");
        }
        tracing::warn!(delta, "gross counter increment dropped after {CAS_ATTEMPTS} conflicts");
        false
    }

    /// Current value of the global counter (0 if never written).
    pub fn gross_counter(&self) -> u64 {
        read_counter(&self.root, GROSS_REF)
            .map(|(_, value)| value)
            .unwrap_or(0)
    }

    /// Lines written since `task` last advanced its copy of the counter.
    /// The first call for a task records the current value and returns 0.
    pub fn gross_churn_since(&self, task: &str) -> u64 {
        let global = self.gross_counter();
        let name = refs::gross_seen_ref(task);
        match read_counter(&self.root, &name) {
            Some((_, seen)) => global.saturating_sub(seen),
            None => {
                if let Some(blob) = write_value(&self.root, global) {
                    refs::compare_and_swap(&self.root, &name, &blob, None);
                }
                0
            }
        }
    }

    /// Like [`ChurnStore::gross_churn_since`], but never creates the task's
    /// copy. `None` until the task has one.
    pub fn peek_gross_churn(&self, task: &str) -> Option<u64> {
        let (_, seen) = read_counter(&self.root, &refs::gross_seen_ref(task))?;
        Some(self.gross_counter().saturating_sub(seen))
    }

    /// Set `task`'s copy of the counter to the current global value.
    pub fn advance_gross_snapshot(&self, task: &str) -> bool {
        let global = self.gross_counter();
        let name = refs::gross_seen_ref(task);
        let Some(blob) = write_value(&self.root, global) else {
            return false;
        };
        let old = refs::read_ref(&self.root, &name);
        if old.as_deref() == Some(blob.as_str()) {
            return true;
        }
        refs::compare_and_swap(&self.root, &name, &blob, old.as_deref())
    }
}

/// Blob id and decimal value behind a counter ref. `None` if the ref is absent;
/// an unreadable blob reads as 0 so the ref can still be swapped.
fn read_counter(root: &Path, name: &str) -> Option<(String, u64)> {
    let oid = refs::read_ref(root, name)?;
    let value = match Git::new(root).text(&["cat-file", "blob", &oid]) {
        Some(body) => body.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(%name, "counter blob is not a number");
            0
        }),
        None => 0,
    };
    Some((oid, value))
}

fn write_value(root: &Path, value: u64) -> Option<String> {
    let body = value.to_string();
    Git::new(root)
        .stdin(body.as_bytes())
        .text(&["hash-object", "-w", "--stdin"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::init_repo;

    fn store(dir: &Path) -> ChurnStore {
        ChurnStore::new(dir, &[]).unwrap()
    }

    #[test]
    fn increments_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        assert_eq!(s.gross_counter(), 0);
        assert!(s.increment_gross(5));
        assert!(s.increment_gross(7));
        assert_eq!(s.gross_counter(), 12);
    }

    #[test]
    fn non_positive_delta_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        assert!(!s.increment_gross(0));
        assert!(!s.increment_gross(-4));
        assert_eq!(s.gross_counter(), 0);
        assert!(refs::read_ref(dir.path(), GROSS_REF).is_none());
    }

    #[test]
    fn gross_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        s.increment_gross(10);
        assert_eq!(s.gross_churn_since("review"), 0);
        assert_eq!(s.gross_churn_since("review"), 0);
        let owned = refs::list_owned(dir.path());
        assert_eq!(owned.len(), 2, "gross + one gross-seen ref: {owned:?}");
    }

    #[test]
    fn gross_churn_tracks_since_advance() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        assert_eq!(s.gross_churn_since("t"), 0);
        s.increment_gross(4);
        s.increment_gross(6);
        assert_eq!(s.gross_churn_since("t"), 10);

        assert!(s.advance_gross_snapshot("t"));
        assert_eq!(s.gross_churn_since("t"), 0);
        s.increment_gross(3);
        assert_eq!(s.gross_churn_since("t"), 3);
    }

    #[test]
    fn peek_never_creates_refs() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        s.increment_gross(8);
        assert_eq!(s.peek_gross_churn("t"), None);
        assert!(refs::read_ref(dir.path(), &refs::gross_seen_ref("t")).is_none());

        s.gross_churn_since("t");
        s.increment_gross(2);
        assert_eq!(s.peek_gross_churn("t"), Some(2));
    }

    #[test]
    fn gross_is_floored_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        s.increment_gross(20);
        s.gross_churn_since("t");
        // Global counter reset underneath the task's copy.
        assert!(refs::delete(dir.path(), GROSS_REF));
        s.increment_gross(1);
        assert_eq!(s.gross_churn_since("t"), 0);
    }

    #[test]
    fn concurrent_increments_never_over_count() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let s = store(dir.path());
        s.increment_gross(100);
        let initial = s.gross_counter();

        const WRITERS: u64 = 6;
        const DELTA: u64 = 5;
        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.increment_gross(DELTA as i64))
            })
            .collect();
        let landed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count() as u64;

        let fin = s.gross_counter();
        assert!(landed >= 1);
        assert!(fin >= initial + DELTA, "final {fin} < {}", initial + DELTA);
        assert!(fin <= initial + WRITERS * DELTA);
        assert_eq!(fin, initial + landed * DELTA);
    }
}
