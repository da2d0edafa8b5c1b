use thiserror::Error;

use crate::devices::ModbusError;
use crate::registers::DecodeError;
use crate::storage::{BackupError, PkError};

/// Reasons a cycle ends without a stored record
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Meter unavailable: {0}")]
    DeviceUnavailable(ModbusError),

    #[error("Meter error: {0}")]
    DeviceError(ModbusError),

    #[error("Register `{field}`: {source}")]
    InvalidPayloadLength { field: String, source: DecodeError },

    #[error("No prior records to number from; seed the first PK explicitly")]
    NoPriorRecords,

    #[error("Corrupt backup record in {file}: {line:?}")]
    CorruptBackupRecord { file: String, line: String },

    #[error("Cannot read local backups: {0}")]
    BackupUnreadable(BackupError),

    #[error("Local write failed: {0}")]
    LocalWriteFailure(BackupError),
}

impl From<PkError> for CycleError {
    fn from(err: PkError) -> Self {
        match err {
            PkError::NoPriorRecords => CycleError::NoPriorRecords,
            PkError::CorruptBackupRecord { file, line } => CycleError::CorruptBackupRecord { file, line },
            PkError::Backup(e) => CycleError::BackupUnreadable(e),
        }
    }
}
