//! Database integrations for the hive query service: the engine driver
//! abstraction, built-in engines, pooled SQLite connections and the metadata store.

pub mod driver;
pub mod metadata;
mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

pub use driver::{
    Driver, DriverError, DriverKind, Drivers, RowSink, SqlConnection, SqlStatement, Value,
};
pub use metadata::{MetadataError, MetadataStore, QueryRecord, QueryStatus, SqliteMetadataStore};
pub use pool::{AcquireError, Pool, Pooled};
