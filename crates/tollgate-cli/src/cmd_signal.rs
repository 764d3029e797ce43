use std::path::Path;
use tollgate_gate::session::{load_session, save_session};
use tollgate_store::ProjectStore;

/// `tollgate signal --session <id> <type> [message]`
pub fn execute(repo_root: &Path, session: &str, kind: &str, message: Option<&str>) -> anyhow::Result<()> {
    raise(&ProjectStore::for_project(repo_root), session, kind, message)?;
    println!("Raised `{kind}` for session {session}");
    Ok(())
}

fn raise(store: &ProjectStore, session: &str, kind: &str, message: Option<&str>) -> anyhow::Result<()> {
    if kind.trim().is_empty() {
        anyhow::bail!("signal type must not be empty");
    }
    let mut state = load_session(store, session)?.unwrap_or_default();
    state.raise_signal(kind, message.unwrap_or_default());
    save_session(store, session, &state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_stored_in_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::at(dir.path());
        raise(&store, "s1", "review", Some("look at the parser")).unwrap();

        let state = load_session(&store, "s1").unwrap().unwrap();
        assert!(state.signal_pending("review"));
        let signal = state.signal.unwrap();
        assert_eq!(signal.message, "look at the parser");
    }

    #[test]
    fn empty_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(raise(&ProjectStore::at(dir.path()), "s1", " ", None).is_err());
    }
}
