//! Local CSV backup, remote daily tables and the record written to both

pub mod auth;
pub mod pk;
pub mod retention;
pub mod sheets;
pub mod writer;

use chrono::{NaiveDate, NaiveDateTime};
use csv::WriterBuilder;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::registers::RegisterMap;

pub use pk::{PkError, PkSequencer};
pub use sheets::{RemoteStore, SheetsClient, SheetsError, TableHandle};
pub use writer::{CommitResult, DualSinkWriter};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FORMAT: &str = "%Y-%m-%d";
const BACKUP_EXTENSION: &str = "csv";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One reading, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub pk: u64,
    pub timestamp: NaiveDateTime,
    pub values: Vec<f64>,
}

impl Record {
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(self.values.len() + 2);
        row.push(self.pk.to_string());
        row.push(self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.extend(self.values.iter().map(|v| format!("{:.3}", v)));
        row
    }
}

/// Column names written once at the top of every daily file and table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header(Vec<String>);

impl Header {
    pub fn for_map(map: &RegisterMap) -> Self {
        let mut columns = vec!["PK_no".to_string(), "read_at".to_string()];
        columns.extend(map.column_names());
        Header(columns)
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// Spreadsheet range covering the header row, e.g. `A1:Q1`
    pub fn range(&self) -> String {
        format!("A1:{}1", column_letter(self.0.len()))
    }
}

/// Spreadsheet column label for a 1-based column index
pub fn column_letter(mut index: usize) -> String {
    let mut label = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        label.push(b'A' + rem as u8);
        index = (index - 1) / 26;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

pub fn backup_name(day: NaiveDate) -> String {
    format!("{}.{}", day.format(DAY_FORMAT), BACKUP_EXTENSION)
}

pub fn table_name(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Daily files on local disk, addressed by file name
pub trait LocalStore {
    /// Backup file names, oldest first
    fn list_entries(&self) -> Result<Vec<String>, BackupError>;

    /// Last non-empty line, or `None` for an empty file
    fn read_last_line(&self, name: &str) -> Result<Option<String>, BackupError>;

    fn exists(&self, name: &str) -> bool;

    fn append_line(&self, name: &str, fields: &[String]) -> Result<(), BackupError>;

    /// Creates the file; fails if it is already there
    fn create_with_header(
        &self,
        name: &str,
        header: &[String],
        first_row: &[String],
    ) -> Result<(), BackupError>;

    fn remove(&self, name: &str) -> Result<(), BackupError>;
}

/// Comma-separated daily backups in one directory
pub struct CsvBackup {
    dir: PathBuf,
}

impl CsvBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CsvBackup { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_rows(&self, file: fs::File, rows: &[&[String]]) -> Result<(), BackupError> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        for row in rows {
            writer.write_record(*row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl LocalStore for CsvBackup {
    fn list_entries(&self) -> Result<Vec<String>, BackupError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // Fresh install: nothing written yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != BACKUP_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_last_line(&self, name: &str) -> Result<Option<String>, BackupError> {
        let text = fs::read_to_string(self.path(name))?;
        Ok(text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn append_line(&self, name: &str, fields: &[String]) -> Result<(), BackupError> {
        let file = OpenOptions::new().append(true).open(self.path(name))?;
        self.write_rows(file, &[fields])
    }

    fn create_with_header(
        &self,
        name: &str,
        header: &[String],
        first_row: &[String],
    ) -> Result<(), BackupError> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))?;
        info!("Created backup file {}", name);
        self.write_rows(file, &[header, first_row])
    }

    fn remove(&self, name: &str) -> Result<(), BackupError> {
        fs::remove_file(self.path(name))?;
        Ok(())
    }
}
