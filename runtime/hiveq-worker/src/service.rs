//! The query service front door: synchronous execution on the caller's
//! thread, or fire-and-forget execution on the shared worker pool.

use std::sync::Arc;

use hiveq_db::{Drivers, MetadataStore, SqliteMetadataStore};

use crate::config::HiveConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, QueryError, ServiceError};
use crate::executor::{Executor, QuerySubmission};
use crate::query_id;
use crate::result::QueryResult;
use crate::result_store::ResultStore;

pub struct HiveService {
    executor: Arc<Executor>,
    dispatcher: Dispatcher,
    select_limit: usize,
}

impl HiveService {
    /// Opens the SQLite metadata store named by the config and builds the service.
    pub fn open(config: HiveConfig, drivers: Drivers) -> Result<Self, ServiceError> {
        let metadata = SqliteMetadataStore::open(&config.metadata_path())?;
        Self::new(config, Arc::new(metadata), drivers)
    }

    pub fn new(
        config: HiveConfig,
        metadata: Arc<dyn MetadataStore>,
        drivers: Drivers,
    ) -> Result<Self, ServiceError> {
        let select_limit = config.select_limit()?;
        let dispatcher = Dispatcher::new(config.worker_threads()?, config.worker_max_queue()?);
        let results = ResultStore::new(config.result_dir());
        let executor = Executor::new(Arc::new(config), results, metadata, drivers);
        tracing::info!(
            workers = dispatcher.worker_count(),
            max_queue = dispatcher.capacity(),
            "hive query service ready"
        );
        Ok(Self {
            executor: Arc::new(executor),
            dispatcher,
            select_limit,
        })
    }

    pub fn results(&self) -> &ResultStore {
        self.executor.results()
    }

    /// Row cap applied to async submissions.
    pub fn select_limit(&self) -> usize {
        self.select_limit
    }

    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue_depth()
    }

    /// Queues the query with the configured `select.limit` and history on,
    /// returning its id at once. Failures are only logged.
    pub fn submit_async(
        &self,
        datasource: &str,
        sql: &str,
        user: &str,
    ) -> Result<String, DispatchError> {
        let submission = QuerySubmission {
            datasource: datasource.to_string(),
            sql: sql.to_string(),
            user: user.to_string(),
            store_history: true,
            row_limit: self.select_limit,
        };
        self.submit_with(submission, |outcome| {
            if let Err(err) = outcome {
                tracing::error!(
                    query_id = %err.query_id,
                    kind = err.kind().as_str(),
                    error = %err.cause,
                    "async query failed"
                );
            }
        })
    }

    /// Queues the query and hands its outcome to `on_done` on the worker thread.
    pub fn submit_with<F>(&self, submission: QuerySubmission, on_done: F) -> Result<String, DispatchError>
    where
        F: FnOnce(Result<QueryResult, QueryError>) + Send + 'static,
    {
        let query_id = query_id::generate(&submission.datasource, &submission.sql);
        let executor = self.executor.clone();
        let id = query_id.clone();
        self.dispatcher
            .submit(move || on_done(executor.execute(&id, &submission)))?;
        Ok(query_id)
    }

    pub fn submit_sync(
        &self,
        datasource: &str,
        sql: &str,
        user: &str,
        store_history: bool,
        row_limit: usize,
    ) -> Result<QueryResult, QueryError> {
        let query_id = query_id::generate(datasource, sql);
        let submission = QuerySubmission {
            datasource: datasource.to_string(),
            sql: sql.to_string(),
            user: user.to_string(),
            store_history,
            row_limit,
        };
        self.executor.execute(&query_id, &submission)
    }
}
