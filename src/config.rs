//! TOML service configuration with environment overrides.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-host setup with the filesystem broker.
//!
//! # Example TOML
//!
//! ```toml
//! [service]
//! name = "esg-service"
//! version = "1.4.0"
//!
//! [logging]
//! level = "info"
//!
//! [broker]
//! transport = "filesystem"
//! base_folder = "/var/lib/esg-service"
//!
//! [api]
//! call_timeout_ms = 5000
//! fit_parameters_enabled = true
//!
//! [worker]
//! concurrency = 4
//! dequeue_wait_ms = 1000
//! queue = "tasks"
//!
//! [gc]
//! interval = "60s"
//! retention = "1d"
//! stale_policy = "ignore"
//! stale_after = "6h"
//! ```
//!
//! # Environment
//!
//! Applied on top of the file by [`ServiceConfig::with_env_overrides`]:
//!
//! | Variable                          | Field                        |
//! |-----------------------------------|------------------------------|
//! | `ESG_LOGLEVEL`, `LOGLEVEL`        | `logging.level`              |
//! | `ESG_VERSION`, `VERSION`          | `service.version`            |
//! | `ESG_BROKER_TRANSPORT`            | `broker.transport`           |
//! | `ESG_BROKER_BASE_FOLDER`          | `broker.base_folder`         |
//! | `ESG_WORKER_CONCURRENCY`          | `worker.concurrency`         |
//! | `ESG_GC_RETENTION`                | `gc.retention`               |
//! | `ESG_FIT_PARAMETERS_ENABLED`      | `api.fit_parameters_enabled` |
//!
//! The `ESG_`-prefixed name wins when both forms are set.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use esg_tasks::gc::parse_duration;
use esg_tasks::store::backend::is_valid_key;
use esg_tasks::{GcConfig, ReaderConfig, StaleTaskPolicy, TaskKind, WorkerConfig};

use crate::error::ConfigError;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Identification.
    pub service: ServiceSection,
    /// Log verbosity.
    pub logging: LoggingSection,
    /// Broker transport and shared storage location.
    pub broker: BrokerSection,
    /// API-side behaviour.
    pub api: ApiSection,
    /// Worker loop tuning.
    pub worker: WorkerSection,
    /// Garbage collection.
    pub gc: GcSection,
}

/// `[service]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    /// Service name used in logs.
    pub name: String,
    /// Deployed version, reported by `config`.
    pub version: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "esg-service".to_string(),
            version: "unknown".to_string(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Level or `tracing` filter directive, used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Which broker transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransportKind {
    /// Shared directory; works across processes on one host.
    #[default]
    Filesystem,
    /// Process-local; for embedding and tests.
    Memory,
}

impl fmt::Display for BrokerTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for BrokerTransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::validation(format!(
                "unknown broker transport {other:?}, expected \"filesystem\" or \"memory\""
            ))),
        }
    }
}

/// `[broker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    /// Transport selection.
    pub transport: BrokerTransportKind,
    /// Root of the filesystem transport and registry.
    pub base_folder: PathBuf,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            transport: BrokerTransportKind::Filesystem,
            base_folder: PathBuf::from("/tmp/esg-service"),
        }
    }
}

/// `[api]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSection {
    /// Deadline for each registry or broker call made for a caller.
    pub call_timeout_ms: u64,
    /// Whether `fit-parameters` tasks are accepted.
    pub fit_parameters_enabled: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            fit_parameters_enabled: true,
        }
    }
}

/// `[worker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    /// Tasks executed at the same time.
    pub concurrency: usize,
    /// Blocking wait on an empty queue.
    pub dequeue_wait_ms: u64,
    /// Work queue name.
    pub queue: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dequeue_wait_ms: 1000,
            queue: "tasks".to_string(),
        }
    }
}

/// Stale-task handling as written in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicyKind {
    /// Never touch non-terminal tasks.
    #[default]
    Ignore,
    /// Log tasks stuck in `running`.
    Report,
    /// Log and fail tasks stuck in `running`.
    Fail,
}

/// `[gc]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcSection {
    /// Time between sweeps, e.g. `"60s"`.
    pub interval: String,
    /// How long terminal tasks stay readable, e.g. `"1d"`.
    pub retention: String,
    /// Stale-task handling.
    pub stale_policy: StalePolicyKind,
    /// Idle time after which a running task counts as stuck.
    pub stale_after: String,
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            retention: "1d".to_string(),
            stale_policy: StalePolicyKind::Ignore,
            stale_after: "6h".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Examples
    ///
    /// ```
    /// use esg_service::config::{BrokerTransportKind, ServiceConfig};
    ///
    /// let config = ServiceConfig::from_toml("[broker]\ntransport = \"memory\"\n").unwrap();
    /// assert_eq!(config.broker.transport, BrokerTransportKind::Memory);
    /// assert_eq!(config.worker.concurrency, 4);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Defaults with the process environment applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(std::env::vars())
    }

    /// Applies the environment variables listed in the module docs, then
    /// validates.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let lookup = |names: &[&str]| names.iter().find_map(|n| vars.get(*n).cloned());

        if let Some(level) = lookup(&["ESG_LOGLEVEL", "LOGLEVEL"]) {
            self.logging.level = level.to_ascii_lowercase();
        }
        if let Some(version) = lookup(&["ESG_VERSION", "VERSION"]) {
            self.service.version = version;
        }
        if let Some(transport) = lookup(&["ESG_BROKER_TRANSPORT"]) {
            self.broker.transport = transport.parse()?;
        }
        if let Some(folder) = lookup(&["ESG_BROKER_BASE_FOLDER"]) {
            self.broker.base_folder = PathBuf::from(folder);
        }
        if let Some(concurrency) = lookup(&["ESG_WORKER_CONCURRENCY"]) {
            self.worker.concurrency = concurrency.trim().parse().map_err(|e| {
                ConfigError::validation(format!(
                    "ESG_WORKER_CONCURRENCY={concurrency:?} is not a number: {e}"
                ))
            })?;
        }
        if let Some(retention) = lookup(&["ESG_GC_RETENTION"]) {
            self.gc.retention = retention;
        }
        if let Some(enabled) = lookup(&["ESG_FIT_PARAMETERS_ENABLED"]) {
            self.api.fit_parameters_enabled = parse_bool(&enabled).ok_or_else(|| {
                ConfigError::validation(format!(
                    "ESG_FIT_PARAMETERS_ENABLED={enabled:?} is not a boolean"
                ))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks that the configuration is usable.
    ///
    /// - `worker.concurrency`, `worker.dequeue_wait_ms` and
    ///   `api.call_timeout_ms` are positive
    /// - `worker.queue` is a plain name
    /// - every `[gc]` duration parses
    /// - `logging.level` is a valid filter directive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::validation("worker.concurrency must be at least 1"));
        }
        if self.worker.dequeue_wait_ms == 0 {
            return Err(ConfigError::validation("worker.dequeue_wait_ms must be positive"));
        }
        if self.api.call_timeout_ms == 0 {
            return Err(ConfigError::validation("api.call_timeout_ms must be positive"));
        }
        if !is_valid_key(&self.worker.queue) {
            return Err(ConfigError::validation(format!(
                "worker.queue {:?} must be alphanumeric with '-', '_' or '.'",
                self.worker.queue
            )));
        }
        self.gc_config()?;
        tracing_subscriber::EnvFilter::try_new(&self.logging.level).map_err(|e| {
            ConfigError::validation(format!("logging.level {:?}: {e}", self.logging.level))
        })?;
        Ok(())
    }

    /// Deadline for API-side registry and broker calls.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.api.call_timeout_ms)
    }

    /// Kinds the dispatcher accepts.
    pub fn enabled_kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                TaskKind::Request => true,
                TaskKind::FitParameters => self.api.fit_parameters_enabled,
            })
            .collect()
    }

    /// Reader settings.
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            call_timeout: self.call_timeout(),
        }
    }

    /// Worker loop settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.worker.queue.clone(),
            concurrency: self.worker.concurrency,
            dequeue_wait: Duration::from_millis(self.worker.dequeue_wait_ms),
            ..WorkerConfig::default()
        }
    }

    /// Garbage collector settings with parsed durations.
    pub fn gc_config(&self) -> Result<GcConfig, ConfigError> {
        let duration = |field: &str, value: &str| {
            parse_duration(value).map_err(|e| ConfigError::validation(format!("gc.{field}: {e}")))
        };
        let interval = duration("interval", &self.gc.interval)?;
        let retention = duration("retention", &self.gc.retention)?;
        let stale_after = duration("stale_after", &self.gc.stale_after)?;
        let stale_policy = match self.gc.stale_policy {
            StalePolicyKind::Ignore => StaleTaskPolicy::Ignore,
            StalePolicyKind::Report => StaleTaskPolicy::Report { after: stale_after },
            StalePolicyKind::Fail => StaleTaskPolicy::FailAfter { after: stale_after },
        };
        Ok(GcConfig {
            interval,
            retention,
            stale_policy,
        })
    }

    /// Directory of the filesystem registry.
    pub fn registry_folder(&self) -> PathBuf {
        self.broker.base_folder.join("registry")
    }

    /// Directory of the filesystem broker.
    pub fn broker_folder(&self) -> PathBuf {
        self.broker.base_folder.join("broker")
    }

    /// The configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
