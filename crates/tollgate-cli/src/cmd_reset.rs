use std::path::Path;
use tollgate_churn::ChurnStore;
use tollgate_store::ProjectStore;

/// `tollgate reset`: forget every task's baseline and all session state
pub fn execute(repo_root: &Path) -> anyhow::Result<()> {
    let (refs, dirs) = reset(repo_root, &ProjectStore::for_project(repo_root))?;
    println!("Deleted {refs} churn refs, cleared {dirs} state directories");
    Ok(())
}

fn reset(repo_root: &Path, store: &ProjectStore) -> anyhow::Result<(usize, usize)> {
    let refs = ChurnStore::new(repo_root, &[])?.delete_all();
    let dirs = store.clear_state()?;
    Ok((refs, dirs))
}
