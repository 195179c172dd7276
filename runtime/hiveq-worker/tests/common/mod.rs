#![allow(dead_code)]

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hiveq_db::{
    Driver, DriverError, DriverKind, Drivers, MetadataStore, QueryRecord, QueryStatus, RowSink,
    SqlConnection, SqlStatement, SqliteMetadataStore, Value,
};
use hiveq_worker::{ENGINE, HiveConfig, HiveService};
use tempfile::TempDir;

/// What the scripted Hive engine answers to every query.
#[derive(Clone, Default)]
pub struct Script {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_delay: Duration,
    pub fail_query: Option<String>,
    /// Queries with this exact text panic inside the engine.
    pub panic_query: Option<String>,
    pub reject_set: bool,
}

impl Script {
    pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            ..Self::default()
        }
    }
}

/// Statements and timeouts seen by the scripted engine.
#[derive(Default)]
pub struct Journal {
    pub statements: Vec<String>,
    pub timeouts: Vec<Duration>,
}

#[derive(Clone)]
pub struct ScriptedHive {
    script: Script,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedHive {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            journal: Arc::default(),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.journal.lock().unwrap().statements.clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.journal.lock().unwrap().timeouts.clone()
    }
}

impl Driver for ScriptedHive {
    fn connect(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        if !url.starts_with("jdbc:hive2://") {
            return Err(DriverError::Connect(format!("unexpected url {url}")));
        }
        Ok(Box::new(self.clone()))
    }
}

impl SqlConnection for ScriptedHive {
    fn create_statement(&mut self) -> Result<Box<dyn SqlStatement + '_>, DriverError> {
        Ok(Box::new(self.clone()))
    }
}

impl SqlStatement for ScriptedHive {
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.journal.lock().unwrap().timeouts.push(timeout);
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.journal.lock().unwrap().statements.push(sql.to_string());
        if self.script.reject_set {
            return Err(DriverError::Sql(format!("cannot execute '{sql}'")));
        }
        Ok(())
    }

    fn execute_query(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<(), DriverError> {
        self.journal.lock().unwrap().statements.push(sql.to_string());
        if self.script.panic_query.as_deref() == Some(sql) {
            panic!("scripted engine crashed on {sql}");
        }
        if let Some(message) = &self.script.fail_query {
            return Err(DriverError::Sql(message.clone()));
        }
        if sink.columns(&self.script.columns).is_break() {
            return Ok(());
        }
        for row in &self.script.rows {
            if !self.script.row_delay.is_zero() {
                thread::sleep(self.script.row_delay);
            }
            if let ControlFlow::Break(()) = sink.row(row.clone()) {
                break;
            }
        }
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub metadata: Arc<SqliteMetadataStore>,
    pub hive: ScriptedHive,
    pub service: HiveService,
}

/// Datasources: `dw` is the scripted Hive engine, `lite` a scratch SQLite
/// database with job tagging best-effort, `strict` the same database with
/// job tagging required.
pub fn base_config(dir: &Path) -> HiveConfig {
    let engine = format!("sqlite:{}", dir.join("engine.db").display());
    HiveConfig::default()
        .with("result.dir", dir.join("result").display())
        .with("hive.worker.threads", 2)
        .with("hive.jdbc.dw.url", "jdbc:hive2://warehouse:10000/default")
        .with("hive.jdbc.dw.user", "analyst")
        .with("hive.jdbc.dw.password", "")
        .with("hive.jdbc.lite.url", &engine)
        .with("hive.jdbc.lite.user", "analyst")
        .with("hive.jdbc.lite.password", "secret")
        .with("hive.job-tag.best-effort.lite", true)
        .with("hive.jdbc.strict.url", &engine)
        .with("hive.jdbc.strict.user", "analyst")
        .with("hive.jdbc.strict.password", "secret")
}

pub fn harness(script: Script) -> Harness {
    harness_with(script, |config| config)
}

pub fn harness_with(script: Script, tune: impl FnOnce(HiveConfig) -> HiveConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tune(base_config(dir.path()));
    let metadata = Arc::new(SqliteMetadataStore::open(&dir.path().join("meta.db")).expect("metadata"));
    let hive = ScriptedHive::new(script);
    let mut drivers = Drivers::builtin();
    drivers.register(DriverKind::Hive, Arc::new(hive.clone()));
    let store: Arc<dyn MetadataStore> = metadata.clone();
    let service = HiveService::new(config, store, drivers).expect("service");
    Harness {
        dir,
        metadata,
        hive,
        service,
    }
}

impl Harness {
    pub fn result_path(&self, datasource: &str, query_id: &str) -> PathBuf {
        self.service
            .results()
            .result_path(datasource, query_id)
            .expect("result path")
    }

    pub fn error_path(&self, datasource: &str, query_id: &str) -> PathBuf {
        self.service
            .results()
            .error_path(datasource, query_id)
            .expect("error path")
    }

    pub fn result_text(&self, datasource: &str, query_id: &str) -> String {
        fs::read_to_string(self.result_path(datasource, query_id)).expect("result file")
    }

    pub fn record(&self, datasource: &str, query_id: &str) -> Option<QueryRecord> {
        self.metadata.find(datasource, ENGINE, query_id).expect("find")
    }

    /// Polls until the query reaches a terminal row or `limit` passes.
    pub fn wait_for_record(&self, datasource: &str, query_id: &str, limit: Duration) -> QueryRecord {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(record) = self.record(datasource, query_id) {
                return record;
            }
            assert!(Instant::now() < deadline, "no record for {query_id}");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

pub fn long(v: i64) -> Value {
    Value::Long(v)
}

pub fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}

pub fn assert_succeeded(record: &QueryRecord) {
    assert_eq!(record.status, QueryStatus::Succeeded);
    assert_eq!(record.error_message, None);
}
