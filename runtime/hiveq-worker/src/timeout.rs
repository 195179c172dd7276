use std::time::{Duration, Instant};

use hiveq_db::MetadataStore;

use crate::error::ExecError;

/// Identifies the query a timeout error row is filed under.
pub struct QueryScope<'a> {
    pub datasource: &'a str,
    pub engine: &'a str,
    pub query_id: &'a str,
    pub sql: &'a str,
}

/// Fails with [`ExecError::Timeout`] once `max_run_time` has passed since
/// `start`, recording an error row first. The engine-side statement timeout is
/// authoritative; this guards engines that ignore it.
pub fn check_timeout(
    metadata: &dyn MetadataStore,
    max_run_time: Duration,
    start: Instant,
    scope: &QueryScope<'_>,
) -> Result<(), ExecError> {
    if start.elapsed() <= max_run_time {
        return Ok(());
    }
    let err = ExecError::Timeout {
        query_id: scope.query_id.to_string(),
        datasource: scope.datasource.to_string(),
        limit: max_run_time,
    };
    let message = err.to_string();
    if let Err(store_err) = metadata.store_error(
        scope.datasource,
        scope.engine,
        scope.query_id,
        scope.sql,
        &message,
    ) {
        tracing::warn!(query_id = scope.query_id, error = %store_err, "failed to record timeout");
    }
    Err(err)
}
