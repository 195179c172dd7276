//! SQLite connection helpers and the SQLite query engine.

use crate::Pool;
#[cfg(feature = "sqlite")]
use crate::driver::{Driver, DriverError, RowSink, SqlConnection, SqlStatement, Value};
use rusqlite::{Connection, OpenFlags};
#[cfg(feature = "sqlite")]
use rusqlite::types::ValueRef;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "sqlite")]
use std::time::Instant;

const BUSY_TIMEOUT_MS: u64 = 5_000;
#[cfg(feature = "sqlite")]
const PROGRESS_OPS: i32 = 1_000;

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    /// Opens read-write, creating the file when missing.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn sqlite_pool(path: &Path, pool_size: usize) -> Arc<Pool<SqliteConn>> {
    let path = path.to_path_buf();
    Pool::new(pool_size, move || SqliteConn::open(&path))
}

/// Engine driver for `sqlite:<path>` datasource URLs. User and password are ignored.
#[cfg(feature = "sqlite")]
pub struct SqliteDriver;

#[cfg(feature = "sqlite")]
impl Driver for SqliteDriver {
    fn connect(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| DriverError::Connect(format!("not a sqlite url: {url}")))?;
        let conn = SqliteConn::open(Path::new(path))
            .map_err(|err| DriverError::Connect(err.to_string()))?;
        Ok(Box::new(conn))
    }
}

#[cfg(feature = "sqlite")]
impl SqlConnection for SqliteConn {
    fn create_statement(&mut self) -> Result<Box<dyn SqlStatement + '_>, DriverError> {
        Ok(Box::new(SqliteStatement {
            conn: &self.conn,
            timeout: None,
        }))
    }
}

#[cfg(feature = "sqlite")]
struct SqliteStatement<'c> {
    conn: &'c Connection,
    timeout: Option<Duration>,
}

#[cfg(feature = "sqlite")]
impl SqliteStatement<'_> {
    /// Interrupts the running statement once the timeout elapses.
    fn arm_timeout(&self) {
        if let Some(limit) = self.timeout {
            let deadline = Instant::now() + limit;
            let _ = self
                .conn
                .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        }
    }

    fn disarm_timeout(&self) {
        if self.timeout.is_some() {
            let _ = self.conn.progress_handler(0, None::<fn() -> bool>);
        }
    }

    fn stream(&self, sql: &str, sink: &mut dyn RowSink) -> Result<(), DriverError> {
        let mut stmt = self.conn.prepare(sql).map_err(sql_error)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if sink.columns(&columns).is_break() {
            return Ok(());
        }
        let mut rows = stmt.query([]).map_err(sql_error)?;
        while let Some(row) = rows.next().map_err(sql_error)? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value = match row.get_ref(idx).map_err(sql_error)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Long(v),
                    ValueRef::Real(v) => Value::Double(v),
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        Value::Text(String::from_utf8_lossy(bytes).into_owned())
                    }
                };
                values.push(value);
            }
            if sink.row(values).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl SqlStatement for SqliteStatement<'_> {
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.arm_timeout();
        let result = self.conn.execute_batch(sql).map_err(sql_error);
        self.disarm_timeout();
        result
    }

    fn execute_query(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<(), DriverError> {
        self.arm_timeout();
        let result = self.stream(sql, sink);
        self.disarm_timeout();
        result
    }
}

#[cfg(feature = "sqlite")]
fn sql_error(err: rusqlite::Error) -> DriverError {
    DriverError::Sql(err.to_string())
}
