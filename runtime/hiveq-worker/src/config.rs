//! Properties-file configuration.
//!
//! Keys follow the `hive.jdbc.<datasource>.url` style of the service's
//! properties file. Values are read once at startup and shared read-only.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SELECT_LIMIT: usize = 500;
const DEFAULT_MAX_RUN_TIME_SECONDS: u64 = 3600;
const DEFAULT_MAX_RESULT_FILE_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_FLUENTD_HOST: &str = "localhost";
const DEFAULT_FLUENTD_PORT: u16 = 24224;
const DEFAULT_RESULT_DIR: &str = "result";
const DEFAULT_METADATA_PATH: &str = "data/hiveq.db";
const DEFAULT_WORKER_THREADS: usize = 10;
const DEFAULT_WORKER_MAX_QUEUE: usize = 1024;

/// Connection coordinates for one datasource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JdbcSettings {
    pub url: String,
    pub user: String,
    pub password: String,
}

#[derive(Clone, Debug, Default)]
pub struct HiveConfig {
    props: HashMap<String, String>,
}

impl HiveConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_properties(&text);
        config.validate()?;
        Ok(config)
    }

    pub fn from_properties(text: &str) -> Self {
        let mut props = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line.find(['=', ':']);
            let (key, value) = match split {
                Some(idx) => (&line[..idx], &line[idx + 1..]),
                None => (line, ""),
            };
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { props }
    }

    /// Sets a single key, replacing any previous value.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }

    /// Checks every typed global key so a bad file fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.select_limit()?;
        self.max_result_file_byte_size()?;
        self.fluentd_port()?;
        self.worker_threads()?;
        self.worker_max_queue()?;
        for key in self.props.keys() {
            if let Some(datasource) = key.strip_prefix("hive.query.max-run-time-seconds.") {
                self.hive_query_max_run_time(datasource)?;
            }
            if let Some(datasource) = key.strip_prefix("hive.job-tag.best-effort.") {
                self.job_tag_best_effort(datasource)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Like [`get`](Self::get) but keeps empty values, e.g. a blank password.
    fn raw(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn hive_jdbc_url(&self, datasource: &str) -> Option<&str> {
        self.raw(&format!("hive.jdbc.{datasource}.url"))
    }

    pub fn hive_jdbc_user(&self, datasource: &str) -> Option<&str> {
        self.raw(&format!("hive.jdbc.{datasource}.user"))
    }

    pub fn hive_jdbc_password(&self, datasource: &str) -> Option<&str> {
        self.raw(&format!("hive.jdbc.{datasource}.password"))
    }

    /// All three coordinates, or the first missing key.
    pub fn jdbc_settings(&self, datasource: &str) -> Result<JdbcSettings, String> {
        let require = |field: &str, value: Option<&str>| {
            value
                .map(str::to_string)
                .ok_or_else(|| format!("hive.jdbc.{datasource}.{field}"))
        };
        Ok(JdbcSettings {
            url: require("url", self.hive_jdbc_url(datasource))?,
            user: require("user", self.hive_jdbc_user(datasource))?,
            password: require("password", self.hive_jdbc_password(datasource))?,
        })
    }

    pub fn select_limit(&self) -> Result<usize, ConfigError> {
        Ok(self.parsed("select.limit")?.unwrap_or(DEFAULT_SELECT_LIMIT))
    }

    pub fn hive_query_max_run_time(&self, datasource: &str) -> Result<Duration, ConfigError> {
        let per_datasource: Option<u64> =
            self.parsed(&format!("hive.query.max-run-time-seconds.{datasource}"))?;
        let seconds = match per_datasource {
            Some(seconds) => seconds,
            None => self
                .parsed("hive.query.max-run-time-seconds")?
                .unwrap_or(DEFAULT_MAX_RUN_TIME_SECONDS),
        };
        Ok(Duration::from_secs(seconds))
    }

    pub fn max_result_file_byte_size(&self) -> Result<u64, ConfigError> {
        Ok(self
            .parsed("max.result.file.byte.size")?
            .unwrap_or(DEFAULT_MAX_RESULT_FILE_BYTES))
    }

    pub fn fluentd_executed_tag(&self) -> Option<&str> {
        self.get("fluentd.executed.tag")
    }

    pub fn fluentd_host(&self) -> &str {
        self.get("fluentd.host").unwrap_or(DEFAULT_FLUENTD_HOST)
    }

    pub fn fluentd_port(&self) -> Result<u16, ConfigError> {
        Ok(self.parsed("fluentd.port")?.unwrap_or(DEFAULT_FLUENTD_PORT))
    }

    pub fn job_tag_best_effort(&self, datasource: &str) -> Result<bool, ConfigError> {
        Ok(self
            .parsed(&format!("hive.job-tag.best-effort.{datasource}"))?
            .unwrap_or(false))
    }

    pub fn result_dir(&self) -> PathBuf {
        PathBuf::from(self.get("result.dir").unwrap_or(DEFAULT_RESULT_DIR))
    }

    pub fn metadata_path(&self) -> PathBuf {
        PathBuf::from(self.get("metadata.sqlite.path").unwrap_or(DEFAULT_METADATA_PATH))
    }

    pub fn worker_threads(&self) -> Result<usize, ConfigError> {
        Ok(self
            .parsed("hive.worker.threads")?
            .unwrap_or(DEFAULT_WORKER_THREADS))
    }

    pub fn worker_max_queue(&self) -> Result<usize, ConfigError> {
        Ok(self
            .parsed("hive.worker.max-queue")?
            .unwrap_or(DEFAULT_WORKER_MAX_QUEUE))
    }
}
