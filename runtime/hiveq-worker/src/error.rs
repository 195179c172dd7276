use std::path::PathBuf;
use std::time::Duration;

use hiveq_db::{DriverError, MetadataError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Why a single query execution failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("missing configuration: {0}")]
    ConfigMissing(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("driver unavailable: {0}")]
    DriverLoad(#[source] DriverError),
    #[error(transparent)]
    Sql(DriverError),
    #[error("Result file size exceeded {cap} bytes. queryId={query_id}")]
    SizeExceeded { cap: u64, query_id: String },
    #[error(
        "Query failed (#{query_id}) in {datasource}: Query exceeded maximum time limit of {}s",
        .limit.as_secs()
    )]
    Timeout {
        query_id: String,
        datasource: String,
        limit: Duration,
    },
    #[error("result file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigMissing,
    DriverLoad,
    Sql,
    SizeExceeded,
    Timeout,
    Io,
    Metadata,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMissing => "ConfigMissing",
            Self::DriverLoad => "DriverLoad",
            Self::Sql => "SqlFailure",
            Self::SizeExceeded => "SizeExceeded",
            Self::Timeout => "Timeout",
            Self::Io => "IoFailure",
            Self::Metadata => "MetadataFailure",
        }
    }
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigMissing(_) | Self::Config(_) => ErrorKind::ConfigMissing,
            Self::DriverLoad(_) => ErrorKind::DriverLoad,
            Self::Sql(_) => ErrorKind::Sql,
            Self::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::Metadata(_) => ErrorKind::Metadata,
        }
    }

    /// Failures that leave an error row in the metadata store.
    pub fn is_recorded(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Sql | ErrorKind::SizeExceeded | ErrorKind::Timeout
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("query {query_id} failed: {cause}")]
pub struct QueryError {
    pub query_id: String,
    #[source]
    pub cause: ExecError,
}

impl QueryError {
    pub fn new(query_id: impl Into<String>, cause: ExecError) -> Self {
        Self {
            query_id: query_id.into(),
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("worker queue full ({capacity} queued)")]
    QueueFull { capacity: usize },
    #[error("dispatcher is shut down")]
    Closed,
}

/// Failure to bring the service up.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}
