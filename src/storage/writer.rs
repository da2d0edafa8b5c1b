use tracing::{info, warn};

use super::sheets::{self, RemoteStore, SheetsError};
use super::{backup_name, table_name, BackupError, Header, LocalStore, Record};

/// What happened on each side of a commit
#[derive(Debug)]
pub struct CommitResult {
    /// `None` when no remote store is configured
    pub remote: Option<Result<(), SheetsError>>,
    pub local: Result<(), BackupError>,
}

impl CommitResult {
    /// Only the local write decides success
    pub fn is_success(&self) -> bool {
        self.local.is_ok()
    }
}

/// Writes each record to the daily remote table (best effort) and then to
/// the daily local file (mandatory).
pub struct DualSinkWriter<'a, L, R> {
    local: &'a L,
    remote: Option<&'a R>,
    header: &'a Header,
}

impl<'a, L: LocalStore, R: RemoteStore> DualSinkWriter<'a, L, R> {
    pub fn new(local: &'a L, remote: Option<&'a R>, header: &'a Header) -> Self {
        DualSinkWriter {
            local,
            remote,
            header,
        }
    }

    pub fn commit(&self, record: &Record) -> CommitResult {
        let row = record.row();

        let remote = self.remote.map(|remote| {
            let result = self.write_remote(remote, record, &row);
            if let Err(e) = &result {
                warn!("Remote write of PK {} failed: {}", record.pk, e);
            }
            result
        });

        let local = self.write_local(record, &row);
        CommitResult { remote, local }
    }

    fn write_remote(&self, remote: &R, record: &Record, row: &[String]) -> sheets::Result<()> {
        let name = table_name(record.day());
        let range = self.header.range();

        let table = match remote.find_table(&name)? {
            Some(table) => {
                // A header write lost right after creation leaves the table blank
                if remote.last_row(&table)?.is_none() {
                    warn!("Remote table {} has no header, writing it", name);
                    remote.update_range(&table, &range, &[self.header.columns().to_vec()])?;
                }
                table
            }
            None => {
                let table = remote.create_table(&name)?;
                remote.update_range(&table, &range, &[self.header.columns().to_vec()])?;
                table
            }
        };
        remote.append_row(&table, &range, row)?;
        info!("Sent PK {} to remote table {}", record.pk, name);
        Ok(())
    }

    fn write_local(&self, record: &Record, row: &[String]) -> Result<(), BackupError> {
        let name = backup_name(record.day());
        if self.local.exists(&name) {
            self.local.append_line(&name, row)?;
        } else {
            self.local.create_with_header(&name, self.header.columns(), row)?;
        }
        info!("Backed up PK {} to {}", record.pk, name);
        Ok(())
    }
}
