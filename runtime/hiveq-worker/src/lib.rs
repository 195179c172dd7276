//! Hive query service: runs SQL against a configured datasource, streams the
//! rows into a newline-delimited JSON result file and records the outcome.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod frame;
pub mod logging;
pub mod query_id;
pub mod result;
pub mod result_store;
pub mod service;
pub mod telemetry;
pub mod timeout;
pub mod writer;

pub use config::{HiveConfig, JdbcSettings};
pub use error::{ConfigError, DispatchError, ErrorKind, ExecError, QueryError, ServiceError};
pub use executor::{ENGINE, Executor, JOB_NAME_PREFIX, QuerySubmission};
pub use result::{DataSize, DataUnit, QueryResult};
pub use result_store::ResultStore;
pub use service::HiveService;
