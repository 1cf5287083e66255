//! Runtime configuration.
//!
//! Loaded from a TOML document; every field can be overridden from the
//! environment (`FLOWLINE_WORKER_THREADS`, `FLOWLINE_MAX_BLOCKING_THREADS`,
//! `FLOWLINE_THREAD_NAME`, `FLOWLINE_LOG`).

use crate::error::RuntimeError;
use serde::Deserialize;
use std::path::Path;

pub const ENV_WORKER_THREADS: &str = "FLOWLINE_WORKER_THREADS";
pub const ENV_MAX_BLOCKING_THREADS: &str = "FLOWLINE_MAX_BLOCKING_THREADS";
pub const ENV_THREAD_NAME: &str = "FLOWLINE_THREAD_NAME";
pub const ENV_LOG: &str = "FLOWLINE_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Async workers driving timers and futures; `None` = one per core.
    pub worker_threads: Option<usize>,
    /// Upper bound on threads running flows concurrently.
    pub max_blocking_threads: usize,
    pub thread_name: String,
    /// `EnvFilter` directives for `telemetry::init_tracing`.
    pub log: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_blocking_threads: 512,
            thread_name: "flowline-worker".to_string(),
            log: "info,flowline_core=debug".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(document: &str) -> Result<Self, RuntimeError> {
        Ok(toml::from_str(document)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, RuntimeError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            self.worker_threads = Some(parse_count(ENV_WORKER_THREADS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_MAX_BLOCKING_THREADS) {
            self.max_blocking_threads = parse_count(ENV_MAX_BLOCKING_THREADS, &raw)?;
        }
        if let Some(name) = lookup(ENV_THREAD_NAME) {
            self.thread_name = name;
        }
        if let Some(log) = lookup(ENV_LOG) {
            self.log = log;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.worker_threads == Some(0) {
            return Err(RuntimeError::InvalidConfig("worker_threads must be at least 1".into()));
        }
        if self.max_blocking_threads == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_blocking_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_count(variable: &str, raw: &str) -> Result<usize, RuntimeError> {
    raw.trim()
        .parse()
        .map_err(|_| RuntimeError::InvalidConfig(format!("{variable}={raw:?} is not a count")))
}
