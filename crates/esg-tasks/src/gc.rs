//! Garbage collection of expired terminal tasks.
//!
//! A sweep lists every task id and checks each entry on its own, so it never
//! holds more than one record at a time and tolerates entries appearing,
//! changing or disappearing while it runs. A terminal task whose
//! `updated_at` is older than the retention window loses its result payload
//! first and its registry entry second; if the sweep dies between the two,
//! the next sweep finishes the job.
//!
//! Non-terminal tasks are left alone unless a [`StaleTaskPolicy`] other than
//! [`StaleTaskPolicy::Ignore`] is configured.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerTransport;
use crate::constants::{DEFAULT_GC_INTERVAL, DEFAULT_RETENTION, STALE_TASK_MESSAGE};
use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::store::TaskRegistry;
use crate::types::task::{TaskKind, TaskStatus};

/// What to do about tasks stuck in `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleTaskPolicy {
    /// Never look at non-terminal tasks.
    #[default]
    Ignore,
    /// List running tasks idle for longer than `after` in
    /// [`SweepReport::stuck`] and log them.
    Report {
        /// Staleness threshold.
        after: Duration,
    },
    /// Like `Report`, and additionally fail those tasks.
    FailAfter {
        /// Staleness threshold.
        after: Duration,
    },
}

impl StaleTaskPolicy {
    fn threshold(&self) -> Option<Duration> {
        match self {
            Self::Ignore => None,
            Self::Report { after } | Self::FailAfter { after } => Some(*after),
        }
    }
}

/// Collector tuning.
///
/// # Defaults
///
/// | Setting        | Default  | Description                                       |
/// |----------------|----------|---------------------------------------------------|
/// | `interval`     | 60 s     | Time between sweeps                               |
/// | `retention`    | 1 day    | How long a terminal task stays readable           |
/// | `stale_policy` | `Ignore` | Handling of tasks stuck in `running`              |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Terminal tasks last updated longer ago than this are collected.
    pub retention: Duration,
    /// Handling of tasks stuck in `running`.
    pub stale_policy: StaleTaskPolicy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_GC_INTERVAL,
            retention: DEFAULT_RETENTION,
            stale_policy: StaleTaskPolicy::Ignore,
        }
    }
}

/// A running task that has not been updated for longer than the staleness
/// threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckTask {
    /// The task.
    pub task_id: String,
    /// Its kind.
    pub kind: TaskKind,
    /// Worker that holds the claim.
    pub claimed_by: Option<String>,
    /// Current attempt.
    pub attempt: u32,
    /// Last registry update.
    pub updated_at: DateTime<Utc>,
    /// Seconds since `updated_at` at sweep time.
    pub idle_seconds: i64,
}

impl StuckTask {
    fn from_record(record: &TaskRecord, now: DateTime<Utc>) -> Self {
        Self {
            task_id: record.task_id.clone(),
            kind: record.kind,
            claimed_by: record.claimed_by.clone(),
            attempt: record.attempt,
            updated_at: record.updated_at,
            idle_seconds: record.idle_for(now).num_seconds(),
        }
    }
}

/// Counters of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Entries examined.
    pub scanned: usize,
    /// Terminal entries deleted.
    pub collected: usize,
    /// Running entries past the staleness threshold.
    pub stuck: Vec<StuckTask>,
    /// Stuck entries failed under [`StaleTaskPolicy::FailAfter`].
    pub reclaimed: usize,
    /// Entries skipped because of a registry or broker error.
    pub errors: usize,
}

/// Deletes expired terminal tasks and their results.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use esg_tasks::broker::memory::InMemoryBroker;
/// use esg_tasks::gc::{GarbageCollector, GcConfig};
/// use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let registry = Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new()));
/// let gc = GarbageCollector::new(registry, Arc::new(InMemoryBroker::new()))
///     .with_config(GcConfig {
///         retention: Duration::from_secs(3600),
///         ..GcConfig::default()
///     });
///
/// let report = gc.sweep().await.unwrap();
/// assert_eq!(report.scanned, 0);
/// # });
/// ```
#[derive(Clone)]
pub struct GarbageCollector {
    registry: Arc<dyn TaskRegistry>,
    broker: Arc<dyn BrokerTransport>,
    config: GcConfig,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    /// Creates a collector with default configuration.
    pub fn new(registry: Arc<dyn TaskRegistry>, broker: Arc<dyn BrokerTransport>) -> Self {
        Self {
            registry,
            broker,
            config: GcConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Sweeps once against the current time.
    pub async fn sweep(&self) -> Result<SweepReport, TaskError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps once as if the time were `now`.
    ///
    /// # Errors
    ///
    /// Only if the id listing itself fails. Per-entry failures are counted
    /// in [`SweepReport::errors`].
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, TaskError> {
        let retention = to_chrono(self.config.retention);
        let stale_after = self.config.stale_policy.threshold().map(to_chrono);
        let mut report = SweepReport::default();

        for task_id in self.registry.list_ids().await? {
            report.scanned += 1;
            let record = match self.registry.get(&task_id).await {
                Ok(record) => record,
                Err(TaskError::NotFound { .. }) => continue,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "gc could not read task");
                    report.errors += 1;
                    continue;
                }
            };

            if record.is_retention_expired(now, retention) {
                match self.collect(&record).await {
                    Ok(true) => report.collected += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "gc could not delete task");
                        report.errors += 1;
                    }
                }
                continue;
            }

            let Some(after) = stale_after else {
                continue;
            };
            if record.status != TaskStatus::Running || record.idle_for(now) <= after {
                continue;
            }

            let stuck = StuckTask::from_record(&record, now);
            tracing::warn!(
                task_id = %stuck.task_id,
                claimed_by = stuck.claimed_by.as_deref().unwrap_or_default(),
                attempt = stuck.attempt,
                idle_seconds = stuck.idle_seconds,
                "task stuck in running"
            );
            if let StaleTaskPolicy::FailAfter { .. } = self.config.stale_policy {
                match self
                    .registry
                    .fail(&task_id, STALE_TASK_MESSAGE.to_string())
                    .await
                {
                    Ok(_) => report.reclaimed += 1,
                    // Finished between the read and the write.
                    Err(TaskError::InvalidTransition { .. } | TaskError::NotFound { .. }) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "gc could not fail stuck task");
                        report.errors += 1;
                    }
                }
            }
            report.stuck.push(stuck);
        }

        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` is cancelled.
    ///
    /// Ticks missed while a sweep runs long are skipped, not queued.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval = ?self.config.interval,
            retention = ?self.config.retention,
            "garbage collector started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(report) if report.collected > 0 || !report.stuck.is_empty() || report.errors > 0 => {
                    tracing::info!(
                        scanned = report.scanned,
                        collected = report.collected,
                        stuck = report.stuck.len(),
                        reclaimed = report.reclaimed,
                        errors = report.errors,
                        "gc sweep finished"
                    );
                }
                Ok(report) => tracing::debug!(scanned = report.scanned, "gc sweep found nothing"),
                Err(e) => tracing::error!(error = %e, "gc sweep failed"),
            }
        }
        tracing::info!("garbage collector stopped");
    }

    /// Runs [`run`](Self::run) on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn collect(&self, record: &TaskRecord) -> Result<bool, TaskError> {
        if let Some(key) = &record.result_ref {
            self.broker.delete_result(key).await?;
        }
        let deleted = self.registry.delete(&record.task_id).await?;
        if deleted {
            tracing::info!(task_id = %record.task_id, status = %record.status, "task collected");
        }
        Ok(deleted)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Error returned by [`parse_duration`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct ParseDurationError {
    /// The rejected input.
    pub input: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Parses operator-facing durations such as `"90s"`, `"15m"`, `"24h"`,
/// `"7d"` or `"1d12h"`.
///
/// Units: `d`, `h`, `m`, `s`. Every number needs a unit and the total must be
/// positive.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use esg_tasks::gc::parse_duration;
///
/// assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("1d12h").unwrap(), Duration::from_secs(36 * 3600));
/// assert!(parse_duration("10").is_err());
/// assert!(parse_duration("0s").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let fail = |reason: String| ParseDurationError {
        input: input.to_string(),
        reason,
    };
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(fail("empty".to_string()));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(fail(format!("expected a number before '{c}'")));
        }
        let n: u64 = digits
            .parse()
            .map_err(|e| fail(format!("bad number {digits}: {e}")))?;
        digits.clear();
        let unit = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            other => return Err(fail(format!("unknown unit '{other}', use d, h, m or s"))),
        };
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| fail("too large".to_string()))?;
    }
    if !digits.is_empty() {
        return Err(fail("missing unit, use d, h, m or s".to_string()));
    }
    if total == 0 {
        return Err(fail("must be greater than zero".to_string()));
    }
    Ok(Duration::from_secs(total))
}
