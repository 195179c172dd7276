//! SQL engine driver abstraction.
//!
//! A datasource URL selects a [`DriverKind`]; the [`Drivers`] registry maps each
//! kind to a [`Driver`]. Connections, statements and result streaming are scoped
//! objects: dropping them releases the underlying engine resources.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no driver available for {0}")]
    Unavailable(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Sql(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Sqlite,
    Postgres,
    Hive,
}

impl DriverKind {
    pub fn from_url(url: &str) -> Result<Self, DriverError> {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "hive2" | "hive" => Ok(Self::Hive),
            _ => Err(DriverError::Unavailable(format!("url scheme '{scheme}'"))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Hive => "hive",
        })
    }
}

/// A single column value as produced by an engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Long(i64),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Textual form written to result files; integers stay decimal, nulls stay null.
    pub fn render(self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Long(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Bool(v) => Some(v.to_string()),
            Value::Text(v) => Some(v),
        }
    }
}

/// Receives the column header and then each row of a result set, in engine order.
/// Returning `ControlFlow::Break` stops the fetch.
pub trait RowSink {
    fn columns(&mut self, names: &[String]) -> ControlFlow<()>;
    fn row(&mut self, values: Vec<Value>) -> ControlFlow<()>;
}

pub trait Driver: Send + Sync {
    fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError>;
}

pub trait SqlConnection {
    fn create_statement(&mut self) -> Result<Box<dyn SqlStatement + '_>, DriverError>;
}

pub trait SqlStatement {
    /// Server-side limit for each subsequent execution, in whole seconds.
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Runs a statement whose results, if any, are discarded.
    fn execute(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Runs a query and streams its rows into `sink`.
    fn execute_query(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<(), DriverError>;
}

/// Maps each [`DriverKind`] to the driver serving it.
#[derive(Clone, Default)]
pub struct Drivers {
    drivers: HashMap<DriverKind, Arc<dyn Driver>>,
}

impl Drivers {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every engine compiled into this build.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut drivers = Self::empty();
        #[cfg(feature = "sqlite")]
        drivers.register(DriverKind::Sqlite, Arc::new(crate::sqlite::SqliteDriver));
        #[cfg(feature = "postgres")]
        drivers.register(DriverKind::Postgres, Arc::new(crate::postgres::PgDriver));
        drivers
    }

    pub fn register(&mut self, kind: DriverKind, driver: Arc<dyn Driver>) {
        self.drivers.insert(kind, driver);
    }

    pub fn resolve(&self, url: &str) -> Result<Arc<dyn Driver>, DriverError> {
        let kind = DriverKind::from_url(url)?;
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DriverError::Unavailable(format!("{kind} datasources")))
    }
}
