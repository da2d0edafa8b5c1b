//! Operator-facing health report: meter, local backups and remote tables

use tracing::{error, info};

use crate::devices::{MeterInfo, MeterLink, ModbusError, RegisterSession};
use crate::storage::sheets::{self, RemoteStore};
use crate::storage::{BackupError, LocalStore};

/// Where the newest stored record lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastBackup {
    pub source: String,
    pub pk: String,
    pub read_at: String,
}

impl LastBackup {
    fn from_fields<'a>(source: &str, mut fields: impl Iterator<Item = &'a str>) -> Self {
        LastBackup {
            source: source.to_string(),
            pk: fields.next().unwrap_or_default().trim().to_string(),
            read_at: fields.next().unwrap_or_default().trim().to_string(),
        }
    }
}

pub fn check_meter<M: MeterLink>(link: &M) -> Result<MeterInfo, ModbusError> {
    let mut session = link.connect()?;
    let info = MeterInfo::read(&mut session);
    session.close();
    info
}

pub fn check_local<L: LocalStore>(store: &L) -> Result<Option<LastBackup>, BackupError> {
    let Some(newest) = store.list_entries()?.pop() else {
        return Ok(None);
    };
    let line = store.read_last_line(&newest)?.unwrap_or_default();
    Ok(Some(LastBackup::from_fields(&newest, line.split(','))))
}

pub fn check_remote<R: RemoteStore>(remote: &R) -> sheets::Result<Option<LastBackup>> {
    let Some(newest) = remote.list_tables()?.into_iter().next() else {
        return Ok(None);
    };
    let row = remote.last_row(&newest)?.unwrap_or_default();
    Ok(Some(LastBackup::from_fields(
        &newest.name,
        row.iter().map(String::as_str),
    )))
}

/// Runs every check and prints the outcome; one failing check does not
/// stop the others. Returns whether all checks passed.
pub fn report<M: MeterLink, L: LocalStore, R: RemoteStore>(
    link: &M,
    local: &L,
    remote: Option<&R>,
) -> bool {
    let mut healthy = true;

    println!("Testing connection to meter...");
    match check_meter(link) {
        Ok(info) => {
            info!("Meter check passed: {}", info.model);
            println!("{}", info);
        }
        Err(e) => {
            error!("Meter check failed: {}", e);
            println!("Meter check failed: {}", e);
            healthy = false;
        }
    }

    if let Some(remote) = remote {
        println!("\nTesting connection to remote tables...");
        match check_remote(remote) {
            Ok(Some(last)) => {
                println!("Last remote backup was at {}.", last.source);
                println!("Last record in remote table was PK {} at {}.", last.pk, last.read_at);
            }
            Ok(None) => println!("No remote tables found."),
            Err(e) => {
                error!("Remote check failed: {}", e);
                println!("Remote check failed: {}", e);
                healthy = false;
            }
        }
    }

    println!("\nViewing last local backup...");
    match check_local(local) {
        Ok(Some(last)) => {
            println!("Last local backup was at {}.", last.source);
            println!("Last record in local backup was PK {} at {}.", last.pk, last.read_at);
        }
        Ok(None) => println!("No local backups found."),
        Err(e) => {
            error!("Local check failed: {}", e);
            println!("Local check failed: {}", e);
            healthy = false;
        }
    }

    healthy
}
