//! Query history and error records.

use crate::pool::{AcquireError, Pool};
use crate::sqlite::{SqliteConn, sqlite_pool};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const POOL_SIZE: usize = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata store sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("metadata store unavailable: {0}")]
    Pool(#[from] AcquireError),
    #[error("metadata store directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Succeeded,
    Failed,
}

impl QueryStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        if value == "succeeded" {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRecord {
    pub datasource: String,
    pub engine: String,
    pub query_id: String,
    pub fetch_result_time_string: String,
    pub query_string: String,
    pub status: QueryStatus,
    pub error_message: Option<String>,
}

/// Shared store of terminal query states. Implementations must tolerate
/// concurrent callers.
pub trait MetadataStore: Send + Sync {
    fn insert_history(
        &self,
        datasource: &str,
        engine: &str,
        sql: &str,
        query_id: &str,
    ) -> Result<(), MetadataError>;

    fn store_error(
        &self,
        datasource: &str,
        engine: &str,
        query_id: &str,
        sql: &str,
        message: &str,
    ) -> Result<(), MetadataError>;

    fn find(
        &self,
        datasource: &str,
        engine: &str,
        query_id: &str,
    ) -> Result<Option<QueryRecord>, MetadataError>;
}

pub struct SqliteMetadataStore {
    pool: Arc<Pool<SqliteConn>>,
}

impl SqliteMetadataStore {
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pool = sqlite_pool(path, POOL_SIZE);
        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    /// Runs `op` on a pooled connection. A connection whose statement failed
    /// is dropped rather than returned, so the next caller opens a fresh one.
    fn with_conn<R>(
        &self,
        op: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> Result<R, MetadataError> {
        let conn = self.pool.acquire(Some(ACQUIRE_TIMEOUT))?;
        match op(conn.connection()) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(error = %err, "metadata statement failed, discarding connection");
                conn.discard();
                Err(err.into())
            }
        }
    }

    fn init(&self) -> Result<(), MetadataError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS query (
                  datasource TEXT NOT NULL,
                  engine TEXT NOT NULL,
                  query_id TEXT NOT NULL,
                  fetch_result_time_string TEXT NOT NULL,
                  query_string TEXT NOT NULL,
                  status TEXT NOT NULL,
                  error_message TEXT,
                  PRIMARY KEY (datasource, engine, query_id)
                );
                "#,
            )
        })
    }

    fn insert(
        &self,
        datasource: &str,
        engine: &str,
        query_id: &str,
        sql: &str,
        status: QueryStatus,
        message: Option<&str>,
    ) -> Result<(), MetadataError> {
        let fetched_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO query \
                 (datasource, engine, query_id, fetch_result_time_string, query_string, status, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![datasource, engine, query_id, fetched_at, sql, status.as_str(), message],
            )
        })?;
        Ok(())
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn insert_history(
        &self,
        datasource: &str,
        engine: &str,
        sql: &str,
        query_id: &str,
    ) -> Result<(), MetadataError> {
        self.insert(datasource, engine, query_id, sql, QueryStatus::Succeeded, None)
    }

    fn store_error(
        &self,
        datasource: &str,
        engine: &str,
        query_id: &str,
        sql: &str,
        message: &str,
    ) -> Result<(), MetadataError> {
        self.insert(datasource, engine, query_id, sql, QueryStatus::Failed, Some(message))
    }

    fn find(
        &self,
        datasource: &str,
        engine: &str,
        query_id: &str,
    ) -> Result<Option<QueryRecord>, MetadataError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT datasource, engine, query_id, fetch_result_time_string, query_string, status, error_message \
                 FROM query WHERE datasource = ?1 AND engine = ?2 AND query_id = ?3",
                params![datasource, engine, query_id],
                |row| {
                    let status: String = row.get(5)?;
                    Ok(QueryRecord {
                        datasource: row.get(0)?,
                        engine: row.get(1)?,
                        query_id: row.get(2)?,
                        fetch_result_time_string: row.get(3)?,
                        query_string: row.get(4)?,
                        status: QueryStatus::parse(&status),
                        error_message: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }
}
