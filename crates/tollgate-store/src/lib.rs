use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable that relocates the per-user store (tests, sandboxes).
pub const HOME_ENV: &str = "TOLLGATE_HOME";

/// Compute a deterministic project ID from a repo root or cwd path.
/// project_id = blake3(normalize_path(input)) → hex string (first 32 chars).
pub fn project_id(repo_root_or_cwd: &Path) -> String {
    let normalized = normalize_path(repo_root_or_cwd);
    let hash = blake3::hash(normalized.as_bytes());
    hash.to_hex()[..32].to_string()
}

/// Normalize a path: canonicalize, lowercase on Windows, forward slashes.
fn normalize_path(p: &Path) -> String {
    let abs = p
        .canonicalize()
        .unwrap_or_else(|_| p.to_path_buf())
        .to_string_lossy()
        .to_string();
    #[cfg(windows)]
    let abs = abs.to_lowercase();
    abs.replace('\\', "/")
}

/// Return the per-user store root.
///
/// `$TOLLGATE_HOME` wins; otherwise the platform data dir (`~/.local/share/tollgate`,
/// `%APPDATA%\tollgate`), falling back to `~/.tollgate`.
pub fn store_root() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("tollgate")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".tollgate")
    } else {
        PathBuf::from(".tollgate-store")
    }
}

/// Return the project directory: `store_root/projects/<project_id>/`
pub fn project_dir(project_id: &str) -> PathBuf {
    store_root().join("projects").join(project_id)
}

/// Encode an arbitrary name (task name, session id) as one path component.
///
/// `[A-Za-z0-9-]` pass through; every other byte becomes `_xx` (lower hex),
/// so distinct names never collide. The result is never empty, never a dot
/// name, and is also a legal git ref component.
pub fn encode_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Log file stem when no session id is known. `encode_component` never
/// yields `_` followed by a non-hex letter, so no session maps here.
const PROJECT_LOG: &str = "_project";

// ── Project store ──

/// Per-project state directory in the user store.
///
/// Layout:
/// ```text
/// <dir>/sessions/<session>.json
/// <dir>/logs/<session>.jsonl       (_project.jsonl when no session is known)
/// <dir>/backchannel/<session>/<task>.md
/// <dir>/jobs/<job-id>/
/// ```
#[derive(Debug, Clone)]
pub struct ProjectStore {
    dir: PathBuf,
}

impl ProjectStore {
    /// Store for the project rooted at `root`, inside the per-user store.
    pub fn for_project(root: &Path) -> Self {
        Self {
            dir: project_dir(&project_id(root)),
        }
    }

    /// Store rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join("sessions")
            .join(format!("{}.json", encode_component(session_id)))
    }

    pub fn log_path(&self, session_id: Option<&str>) -> PathBuf {
        let name = match session_id {
            Some(sid) if !sid.is_empty() => encode_component(sid),
            _ => PROJECT_LOG.to_string(),
        };
        self.dir.join("logs").join(format!("{name}.jsonl"))
    }

    pub fn backchannel_path(&self, session_id: &str, task: &str) -> PathBuf {
        self.dir
            .join("backchannel")
            .join(encode_component(session_id))
            .join(format!("{}.md", encode_component(task)))
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.dir.join("jobs")
    }

    /// Remove sessions, backchannels and detached jobs. Logs are kept.
    /// Returns the number of top-level directories removed.
    pub fn clear_state(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for sub in ["sessions", "backchannel", "jobs"] {
            let path = self.dir.join(sub);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
                tracing::debug!(path = %path.display(), "removed state dir");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Atomic write: write to temp file in same dir, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_deterministic() {
        let id1 = project_id(Path::new("/tmp/test-repo"));
        let id2 = project_id(Path::new("/tmp/test-repo"));
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 32);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn store_root_is_not_empty() {
        let root = store_root();
        assert!(!root.as_os_str().is_empty());
    }

    #[test]
    fn encoding_is_injective_and_safe() {
        assert_eq!(encode_component("fast-tests"), "fast-tests");
        assert_eq!(encode_component("unit tests"), "unit_20tests");
        assert_ne!(encode_component("unit tests"), encode_component("unit-tests"));
        assert_eq!(encode_component("a_b"), "a_5fb");
        assert_eq!(encode_component("../x"), "_2e_2e_2fx");
        assert_eq!(encode_component(""), "_");
    }

    #[test]
    fn store_paths_are_scoped() {
        let store = ProjectStore::at("/store/p1");
        assert_eq!(
            store.session_path("abc"),
            PathBuf::from("/store/p1/sessions/abc.json")
        );
        assert_eq!(
            store.log_path(None),
            PathBuf::from("/store/p1/logs/_project.jsonl")
        );
        assert_ne!(store.log_path(Some("project")), store.log_path(None));
        assert_eq!(
            store.log_path(Some("s/1")),
            PathBuf::from("/store/p1/logs/s_2f1.jsonl")
        );
        assert_eq!(
            store.backchannel_path("s1", "unit tests"),
            PathBuf::from("/store/p1/backchannel/s1/unit_20tests.md")
        );
        assert_ne!(
            store.backchannel_path("s1", "unit tests"),
            store.backchannel_path("s1", "unit-tests")
        );
    }

    #[test]
    fn clear_state_keeps_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::at(tmp.path());
        write_atomic(&store.session_path("s1"), b"{}").unwrap();
        write_atomic(&store.backchannel_path("s1", "t"), b"x").unwrap();
        write_atomic(&store.log_path(Some("s1")), b"{}\n").unwrap();

        assert_eq!(store.clear_state().unwrap(), 2);
        assert!(!store.session_path("s1").exists());
        assert!(store.log_path(Some("s1")).exists());
        assert_eq!(store.clear_state().unwrap(), 0);
    }

    #[test]
    fn write_atomic_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("test.txt");
        write_atomic(&path, b"hello world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
    }
}
