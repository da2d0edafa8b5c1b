use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use super::{backup_name, BackupError, LocalStore};

#[derive(Error, Debug)]
pub enum PkError {
    #[error("No backup files to continue numbering from")]
    NoPriorRecords,

    #[error("Last record of {file} has no readable PK: {line:?}")]
    CorruptBackupRecord { file: String, line: String },

    #[error("Cannot read backups: {0}")]
    Backup(#[from] BackupError),
}

/// Derives the next record identifier from the newest local backup.
///
/// Numbering is only safe while cycles never overlap; two cycles reading the
/// same last record will hand out the same identifier.
pub struct PkSequencer<'a, L> {
    store: &'a L,
}

impl<'a, L: LocalStore> PkSequencer<'a, L> {
    pub fn new(store: &'a L) -> Self {
        PkSequencer { store }
    }

    pub fn next_pk(&self, today: NaiveDate) -> Result<u64, PkError> {
        let file = self.last_file(today)?;
        let line = self
            .store
            .read_last_line(&file)?
            .ok_or_else(|| PkError::CorruptBackupRecord {
                file: file.clone(),
                line: String::new(),
            })?;

        let last = line
            .split(',')
            .next()
            .and_then(|field| field.trim().parse::<u64>().ok())
            .ok_or_else(|| PkError::CorruptBackupRecord {
                file: file.clone(),
                line: line.clone(),
            })?;

        debug!("Last PK {} found in {}", last, file);
        Ok(last + 1)
    }

    fn last_file(&self, today: NaiveDate) -> Result<String, PkError> {
        let todays = backup_name(today);
        if self.store.exists(&todays) {
            return Ok(todays);
        }
        self.store
            .list_entries()?
            .pop()
            .ok_or(PkError::NoPriorRecords)
    }
}
