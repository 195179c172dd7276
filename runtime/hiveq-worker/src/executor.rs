//! Per-query execution: connect, tag the job, stream rows into the result
//! file, enforce the byte and time budgets, then record history and emit
//! telemetry.

use std::fs::{self, File};
use std::io::BufWriter;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hiveq_db::{Drivers, MetadataStore, RowSink, Value};

use crate::config::HiveConfig;
use crate::error::{ErrorKind, ExecError, QueryError};
use crate::result::{DataSize, QueryResult};
use crate::result_store::ResultStore;
use crate::telemetry::{ExecutedEvent, FluentSink};
use crate::timeout::{QueryScope, check_timeout};
use crate::writer::ResultFileWriter;

pub const ENGINE: &str = "hive";
pub const JOB_NAME_PREFIX: &str = "yanagishima-hive-";

#[derive(Clone, Debug)]
pub struct QuerySubmission {
    pub datasource: String,
    pub sql: String,
    pub user: String,
    pub store_history: bool,
    pub row_limit: usize,
}

pub struct Executor {
    config: Arc<HiveConfig>,
    results: ResultStore,
    metadata: Arc<dyn MetadataStore>,
    drivers: Drivers,
}

impl Executor {
    pub fn new(
        config: Arc<HiveConfig>,
        results: ResultStore,
        metadata: Arc<dyn MetadataStore>,
        drivers: Drivers,
    ) -> Self {
        Self {
            config,
            results,
            metadata,
            drivers,
        }
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn execute(
        &self,
        query_id: &str,
        submission: &QuerySubmission,
    ) -> Result<QueryResult, QueryError> {
        let span = tracing::info_span!(
            "query",
            query_id,
            datasource = %submission.datasource,
            engine = ENGINE,
        );
        let _entered = span.enter();
        self.run(query_id, submission).map_err(|cause| {
            self.record_failure(query_id, submission, &cause);
            QueryError::new(query_id, cause)
        })
    }

    fn run(&self, query_id: &str, submission: &QuerySubmission) -> Result<QueryResult, ExecError> {
        let datasource = submission.datasource.as_str();
        let jdbc = self
            .config
            .jdbc_settings(datasource)
            .map_err(ExecError::ConfigMissing)?;
        let max_run_time = self.config.hive_query_max_run_time(datasource)?;
        let cap = self.config.max_result_file_byte_size()?;
        let best_effort_tag = self.config.job_tag_best_effort(datasource)?;
        let telemetry = match self.config.fluentd_executed_tag() {
            Some(tag) => Some((
                tag,
                FluentSink::new(self.config.fluentd_host(), self.config.fluentd_port()?),
            )),
            None => None,
        };

        let driver = self.drivers.resolve(&jdbc.url).map_err(ExecError::DriverLoad)?;
        let mut connection = driver
            .connect(&jdbc.url, &jdbc.user, &jdbc.password)
            .map_err(ExecError::Sql)?;
        let start = Instant::now();
        tracing::info!(user = %submission.user, "query started");

        let mut statement = connection.create_statement().map_err(ExecError::Sql)?;
        statement
            .set_query_timeout(max_run_time)
            .map_err(ExecError::Sql)?;
        let job_name = format!("{JOB_NAME_PREFIX}{query_id}");
        if let Err(err) = statement.execute(&format!("set mapreduce.job.name={job_name}")) {
            if !best_effort_tag {
                return Err(ExecError::Sql(err));
            }
            tracing::debug!(error = %err, "job tag not accepted");
        }

        let path = self.results.result_path(datasource, query_id)?;
        let mut stream = ResultStream {
            path: &path,
            writer: None,
            columns: Vec::new(),
            records: Vec::new(),
            warning_message: None,
            retain_all: is_show(&submission.sql),
            row_limit: submission.row_limit,
            cap,
            metadata: self.metadata.as_ref(),
            max_run_time,
            start,
            scope: QueryScope {
                datasource,
                engine: ENGINE,
                query_id,
                sql: &submission.sql,
            },
            failure: None,
        };
        let fetched = statement.execute_query(&submission.sql, &mut stream);
        if let Some(failure) = stream.failure.take() {
            return Err(failure);
        }
        fetched.map_err(ExecError::Sql)?;

        let writer = match stream.writer.take() {
            Some(writer) => writer,
            None => {
                let writer = open_result_file(&path, &[])?;
                stream.check_size(writer.bytes())?;
                writer
            }
        };
        let line_number = writer.line_number();
        writer.finish()?;
        let raw_data_size = DataSize::succinct(fs::metadata(&path)?.len());

        if submission.store_history {
            self.metadata
                .insert_history(datasource, ENGINE, &submission.sql, query_id)?;
        }

        let elapsed = start.elapsed();
        if let Some((tag, sink)) = telemetry {
            let event = ExecutedEvent {
                elapsed_time_millseconds: elapsed.as_millis() as u64,
                user: &submission.user,
                query: &submission.sql,
                query_id,
                datasource,
                engine: ENGINE,
            };
            if let Err(err) = sink.emit(tag, &event) {
                tracing::warn!(error = %err, tag, "failed to emit telemetry");
            }
        }
        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            line_number,
            "query finished"
        );

        Ok(QueryResult {
            query_id: query_id.to_string(),
            columns: stream.columns,
            records: stream.records,
            line_number,
            raw_data_size,
            warning_message: stream.warning_message,
        })
    }

    fn record_failure(&self, query_id: &str, submission: &QuerySubmission, cause: &ExecError) {
        if !cause.is_recorded() {
            tracing::warn!(kind = cause.kind().as_str(), error = %cause, "query failed");
            return;
        }
        let message = cause.to_string();
        // Timeouts file their own row before surfacing.
        if cause.kind() != ErrorKind::Timeout {
            if let Err(err) = self.metadata.store_error(
                &submission.datasource,
                ENGINE,
                query_id,
                &submission.sql,
                &message,
            ) {
                tracing::warn!(error = %err, "failed to record query error");
            }
        }
        match self.results.error_path(&submission.datasource, query_id) {
            Ok(path) => {
                if let Err(err) = fs::write(&path, &message) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to write error file");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to resolve error file"),
        }
        tracing::warn!(kind = cause.kind().as_str(), error = %message, "query failed");
    }
}

fn is_show(sql: &str) -> bool {
    sql.get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("show"))
}

fn fetch_stopped_message(retained: usize, row_limit: usize) -> String {
    format!("now fetch size is {retained}. This is more than {row_limit}. So, fetch operation stopped.")
}

/// Sink that materializes a result set into the result file while building
/// the in-memory summary. The first failure is parked in `failure` and the
/// fetch is stopped.
struct ResultStream<'a> {
    path: &'a Path,
    writer: Option<ResultFileWriter<BufWriter<File>>>,
    columns: Vec<String>,
    records: Vec<Vec<Option<String>>>,
    warning_message: Option<String>,
    retain_all: bool,
    row_limit: usize,
    cap: u64,
    metadata: &'a dyn MetadataStore,
    max_run_time: Duration,
    start: Instant,
    scope: QueryScope<'a>,
    failure: Option<ExecError>,
}

fn open_result_file(
    path: &Path,
    columns: &[String],
) -> std::io::Result<ResultFileWriter<BufWriter<File>>> {
    let mut writer = ResultFileWriter::create(path)?;
    writer.write_line(columns)?;
    Ok(writer)
}

impl ResultStream<'_> {
    fn check_size(&self, bytes: u64) -> Result<(), ExecError> {
        if bytes > self.cap {
            return Err(ExecError::SizeExceeded {
                cap: self.cap,
                query_id: self.scope.query_id.to_string(),
            });
        }
        Ok(())
    }

    fn accept_columns(&mut self, names: &[String]) -> Result<(), ExecError> {
        let writer = open_result_file(self.path, names)?;
        self.check_size(writer.bytes())?;
        self.writer = Some(writer);
        self.columns = names.to_vec();
        Ok(())
    }

    fn accept_row(&mut self, values: Vec<Value>) -> Result<(), ExecError> {
        let row: Vec<Option<String>> = values.into_iter().map(Value::render).collect();
        let writer = match &mut self.writer {
            Some(writer) => writer,
            slot => slot.insert(open_result_file(self.path, &[])?),
        };
        writer.write_line(&row)?;
        let bytes = writer.bytes();
        self.check_size(bytes)?;

        if self.retain_all || self.records.len() < self.row_limit {
            self.records.push(row);
        } else if self.warning_message.is_none() {
            self.warning_message = Some(fetch_stopped_message(self.records.len(), self.row_limit));
        }

        check_timeout(self.metadata, self.max_run_time, self.start, &self.scope)
    }

    fn park(&mut self, result: Result<(), ExecError>) -> ControlFlow<()> {
        match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                self.failure = Some(err);
                ControlFlow::Break(())
            }
        }
    }
}

impl RowSink for ResultStream<'_> {
    fn columns(&mut self, names: &[String]) -> ControlFlow<()> {
        let result = self.accept_columns(names);
        self.park(result)
    }

    fn row(&mut self, values: Vec<Value>) -> ControlFlow<()> {
        let result = self.accept_row(values);
        self.park(result)
    }
}
