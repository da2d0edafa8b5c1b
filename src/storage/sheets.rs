use serde::Deserialize;
use serde_json::json;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::auth::TokenSource;
use crate::config::CloudConfig;

const DRIVE_FILES: &str = "https://www.googleapis.com/drive/v3/files";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
const LIST_PAGE_SIZE: &str = "100";

#[derive(Error, Debug)]
pub enum SheetsError {
    #[error("HTTP error: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot sign token request: {0}")]
    Auth(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid service account file: {0}")]
    Credentials(#[from] serde_json::Error),

    #[error("Unexpected response: {0}")]
    Response(String),
}

impl From<ureq::Error> for SheetsError {
    fn from(err: ureq::Error) -> Self {
        SheetsError::Http(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SheetsError>;

/// A spreadsheet in the remote folder
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableHandle {
    pub id: String,
    pub name: String,
}

/// Daily tables kept in a remote spreadsheet folder
pub trait RemoteStore {
    fn find_table(&self, name: &str) -> Result<Option<TableHandle>>;

    fn create_table(&self, name: &str) -> Result<TableHandle>;

    fn append_row(&self, table: &TableHandle, range: &str, row: &[String]) -> Result<()>;

    fn update_range(&self, table: &TableHandle, range: &str, rows: &[Vec<String>]) -> Result<()>;

    /// Tables in the folder, newest name first
    fn list_tables(&self) -> Result<Vec<TableHandle>>;

    fn trash_table(&self, table: &TableHandle) -> Result<()>;

    fn last_row(&self, table: &TableHandle) -> Result<Option<Vec<String>>>;
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<TableHandle>,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Drive v3 and Sheets v4 over blocking HTTP
pub struct SheetsClient {
    agent: ureq::Agent,
    folder_id: String,
    tokens: TokenSource,
}

impl SheetsClient {
    pub fn new(config: &CloudConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        SheetsClient {
            tokens: TokenSource::new(config.service_account_file.clone(), agent.clone()),
            agent,
            folder_id: config.folder_id.clone(),
        }
    }

    fn bearer(&self) -> Result<String> {
        self.tokens.bearer()
    }

    fn get(&self, url: &str) -> Result<ureq::Request> {
        Ok(self.agent.get(url).set("Authorization", &self.bearer()?))
    }

    fn folder_query(&self, extra: Option<&str>) -> String {
        let mut q = format!(
            "'{}' in parents and mimeType = '{}' and trashed = false",
            escape(&self.folder_id),
            SPREADSHEET_MIME
        );
        if let Some(name) = extra {
            q.push_str(&format!(" and name = '{}'", escape(name)));
        }
        q
    }

    fn files(&self, query: &str, order_by: &str) -> Result<Vec<TableHandle>> {
        let list: FileList = self
            .get(DRIVE_FILES)?
            .query("q", query)
            .query("orderBy", order_by)
            .query("pageSize", LIST_PAGE_SIZE)
            .query("fields", "files(id, name)")
            .query("supportsAllDrives", "true")
            .query("includeItemsFromAllDrives", "true")
            .call()?
            .into_json()?;
        Ok(list.files)
    }
}

impl RemoteStore for SheetsClient {
    fn find_table(&self, name: &str) -> Result<Option<TableHandle>> {
        let mut found = self.files(&self.folder_query(Some(name)), "createdTime")?;
        Ok(if found.is_empty() { None } else { Some(found.remove(0)) })
    }

    fn create_table(&self, name: &str) -> Result<TableHandle> {
        let table: TableHandle = self
            .agent
            .post(DRIVE_FILES)
            .set("Authorization", &self.bearer()?)
            .query("supportsAllDrives", "true")
            .send_json(json!({
                "name": name,
                "parents": [self.folder_id],
                "mimeType": SPREADSHEET_MIME,
            }))?
            .into_json()?;
        info!("Created remote table {} ({})", table.name, table.id);
        Ok(table)
    }

    fn append_row(&self, table: &TableHandle, range: &str, row: &[String]) -> Result<()> {
        self.agent
            .post(&format!("{}/{}/values/{}:append", SHEETS_API, table.id, range))
            .set("Authorization", &self.bearer()?)
            .query("valueInputOption", "USER_ENTERED")
            .query("insertDataOption", "OVERWRITE")
            .send_json(json!({ "majorDimension": "ROWS", "values": [row] }))?;
        Ok(())
    }

    fn update_range(&self, table: &TableHandle, range: &str, rows: &[Vec<String>]) -> Result<()> {
        self.agent
            .put(&format!("{}/{}/values/{}", SHEETS_API, table.id, range))
            .set("Authorization", &self.bearer()?)
            .query("valueInputOption", "USER_ENTERED")
            .send_json(json!({ "majorDimension": "ROWS", "values": rows }))?;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<TableHandle>> {
        self.files(&self.folder_query(None), "name desc")
    }

    fn trash_table(&self, table: &TableHandle) -> Result<()> {
        self.agent
            .request("PATCH", &format!("{}/{}", DRIVE_FILES, table.id))
            .set("Authorization", &self.bearer()?)
            .query("supportsAllDrives", "true")
            .send_json(json!({ "trashed": true }))?;
        Ok(())
    }

    fn last_row(&self, table: &TableHandle) -> Result<Option<Vec<String>>> {
        let range: ValueRange = self
            .get(&format!("{}/{}/values/A:ZZ", SHEETS_API, table.id))?
            .call()?
            .into_json()?;
        Ok(range.values.into_iter().rev().find(|row| !row.is_empty()))
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
