use tracing::info;

use super::sheets::{self, RemoteStore};
use super::{BackupError, LocalStore};

/// Deletes all but the newest `keep` daily backups; returns the removed names
pub fn prune_local<L: LocalStore>(store: &L, keep: usize) -> Result<Vec<String>, BackupError> {
    let mut names = store.list_entries()?;
    names.reverse();

    let mut removed = Vec::new();
    for name in names.into_iter().skip(keep) {
        store.remove(&name)?;
        info!("Deleted {}", name);
        removed.push(name);
    }
    Ok(removed)
}

/// Trashes all but the newest `keep` remote tables
pub fn prune_remote<R: RemoteStore>(remote: &R, keep: usize) -> sheets::Result<Vec<String>> {
    let mut removed = Vec::new();
    for table in remote.list_tables()?.into_iter().skip(keep) {
        remote.trash_table(&table)?;
        info!("Trashed sheet {}", table.name);
        removed.push(table.name);
    }
    Ok(removed)
}
