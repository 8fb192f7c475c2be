//! Filesystem broker transport.
//!
//! Lets API and worker processes exchange work through a shared directory,
//! with no broker daemon. Every state change is a `rename`, which is atomic
//! on one filesystem, so two consumers can never both own a message.
//!
//! # Layout
//!
//! ```text
//! <base>/queues/<queue>/<seq>-<task_id>.json     waiting messages, FIFO by name
//! <base>/inflight/<queue>/<seq>-<task_id>.json   delivered, not yet acknowledged
//! <base>/results/<key>.json                      result payloads
//! <base>/dead-letter/<queue>/...                 messages that failed to decode
//! ```
//!
//! Blocking dequeues poll the queue directory every `poll_interval` until
//! the wait elapses. Dequeue is cancel-safe: a claim whose caller went away
//! is returned to the queue.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerTransport};
use crate::store::backend::is_valid_key;
use crate::types::message::{Delivery, TaskMessage};

const MESSAGE_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    message: TaskMessage,
    #[serde(default)]
    redelivered: bool,
}

/// Directory-backed broker transport.
#[derive(Debug)]
pub struct FsBroker {
    base: PathBuf,
    poll_interval: Duration,
    seq: AtomicU64,
}

impl FsBroker {
    /// Opens (and creates if needed) a broker rooted at `base`.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let base = base.into();
        for dir in ["queues", "inflight", "results", "dead-letter"] {
            let path = base.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| BrokerError::io(format!("failed to create {}", path.display()), e))?;
        }
        Ok(Self {
            base,
            poll_interval: Duration::from_millis(100),
            seq: AtomicU64::new(0),
        })
    }

    /// How often a blocking dequeue re-checks an empty queue.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf, BrokerError> {
        check_name("queue", queue)?;
        Ok(self.base.join("queues").join(queue))
    }

    fn inflight_dir(&self, queue: &str) -> Result<PathBuf, BrokerError> {
        check_name("queue", queue)?;
        Ok(self.base.join("inflight").join(queue))
    }

    fn result_path(&self, key: &str) -> PathBuf {
        self.base.join("results").join(format!("{key}{MESSAGE_SUFFIX}"))
    }

    fn next_name(&self, task_id: &str) -> String {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        format!("{micros:020}-{seq:06}-{task_id}{MESSAGE_SUFFIX}")
    }

    /// Returns in-flight messages delivered at least `older_than` ago to the
    /// front of their queues, flagged as redelivered.
    ///
    /// Run this when a consumer is known to have died, or periodically with
    /// an age well above the longest expected execution time. In-flight
    /// files that no longer decode are moved to the dead-letter directory.
    pub async fn recover_unacked(&self, older_than: Duration) -> Result<usize, BrokerError> {
        let inflight_root = self.base.join("inflight");
        let mut recovered = 0;
        for queue in list_dir(&inflight_root, false).await? {
            let claimer = self.claimer(&queue)?;
            for name in list_dir(&claimer.inflight, true).await? {
                let path = claimer.inflight.join(&name);
                if !is_older_than(&path, older_than).await {
                    continue;
                }
                let Ok(bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let mut envelope: FileEnvelope = match serde_json::from_slice(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        claimer.dead_letter(&name, &e).await;
                        continue;
                    }
                };
                envelope.redelivered = true;
                write_atomic(&path, &encode(&envelope)?).await?;
                match tokio::fs::rename(&path, claimer.queue_dir.join(&name)).await {
                    Ok(()) => recovered += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(BrokerError::io("failed to requeue message", e)),
                }
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "requeued unacknowledged deliveries");
        }
        Ok(recovered)
    }

    fn claimer(&self, queue: &str) -> Result<Claimer, BrokerError> {
        Ok(Claimer {
            queue: queue.to_string(),
            queue_dir: self.queue_dir(queue)?,
            inflight: self.inflight_dir(queue)?,
            dead_letter: self.base.join("dead-letter").join(queue),
        })
    }

    /// Claims the next message on a detached task.
    ///
    /// A claim moves a file into `inflight/`; if the caller is dropped
    /// before the delivery reaches it, the detached task moves the file back
    /// so the message stays deliverable.
    async fn claim_next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let claimer = self.claimer(queue)?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let claimed = claimer.try_claim().await;
            if let Err(Ok(Some(delivery))) = tx.send(claimed) {
                claimer.release(&delivery).await;
            }
        });
        rx.await.map_err(|_| BrokerError::Unavailable {
            message: "claim task ended without a result".to_string(),
        })?
    }
}

/// Paths of one queue, detached from the broker so a claim can outlive the
/// caller.
#[derive(Debug, Clone)]
struct Claimer {
    queue: String,
    queue_dir: PathBuf,
    inflight: PathBuf,
    dead_letter: PathBuf,
}

impl Claimer {
    async fn try_claim(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut names = list_dir(&self.queue_dir, true).await?;
        names.sort();

        for name in names {
            let claimed = self.inflight.join(&name);
            match tokio::fs::rename(self.queue_dir.join(&name), &claimed).await {
                Ok(()) => {}
                // Another consumer won the race for this message.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(BrokerError::io("failed to claim message", e)),
            }
            if let Err(e) = touch(&claimed).await {
                tracing::debug!(error = %e, "could not refresh delivery timestamp");
            }

            let bytes = match tokio::fs::read(&claimed).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.restore(&name).await;
                    return Err(BrokerError::io("failed to read claimed message", e));
                }
            };
            match serde_json::from_slice::<FileEnvelope>(&bytes) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        queue: self.queue.clone(),
                        message: envelope.message,
                        receipt: name,
                        redelivered: envelope.redelivered,
                    }))
                }
                Err(e) => self.dead_letter(&name, &e).await,
            }
        }
        Ok(None)
    }

    /// Hands an undelivered claim back to the queue.
    async fn release(&self, delivery: &Delivery) {
        tracing::debug!(queue = %self.queue, task_id = %delivery.message.task_id, "returning unreceived delivery to the queue");
        self.restore(&delivery.receipt).await;
    }

    async fn restore(&self, name: &str) {
        if let Err(e) = tokio::fs::rename(self.inflight.join(name), self.queue_dir.join(name)).await {
            tracing::error!(queue = %self.queue, file = %name, error = %e, "failed to return message to the queue");
        }
    }

    async fn dead_letter(&self, name: &str, cause: &serde_json::Error) {
        tracing::error!(queue = %self.queue, file = %name, error = %cause, "undecodable message moved to dead-letter");
        let moved = match tokio::fs::create_dir_all(&self.dead_letter).await {
            Ok(()) => tokio::fs::rename(self.inflight.join(name), self.dead_letter.join(name)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = moved {
            tracing::error!(queue = %self.queue, file = %name, error = %e, "failed to move message to dead-letter");
        }
    }
}

#[async_trait]
impl BrokerTransport for FsBroker {
    async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<(), BrokerError> {
        check_name("task id", &message.task_id)?;
        let queue_dir = self.queue_dir(queue)?;
        let inflight = self.inflight_dir(queue)?;
        for dir in [&queue_dir, &inflight] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BrokerError::io("failed to create queue directory", e))?;
        }
        let envelope = FileEnvelope {
            message: message.clone(),
            redelivered: false,
        };
        let name = self.next_name(&message.task_id);
        write_atomic(&queue_dir.join(name), &encode(&envelope)?).await?;
        tracing::debug!(queue = queue, task_id = %message.task_id, "message enqueued");
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if let Some(delivery) = self.claim_next(queue).await? {
                return Ok(Some(delivery));
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        check_name("receipt", &delivery.receipt)?;
        let path = self.inflight_dir(&delivery.queue)?.join(&delivery.receipt);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BrokerError::UnknownReceipt {
                receipt: delivery.receipt.clone(),
            }),
            Err(e) => Err(BrokerError::io("failed to acknowledge message", e)),
        }
    }

    async fn store_result(&self, key: &str, payload: &Value) -> Result<(), BrokerError> {
        check_name("result key", key)?;
        let bytes = serde_json::to_vec(payload).map_err(|e| BrokerError::Codec {
            message: format!("failed to encode result {key}: {e}"),
        })?;
        write_atomic(&self.result_path(key), &bytes).await
    }

    async fn fetch_result(&self, key: &str) -> Result<Value, BrokerError> {
        if !is_valid_key(key) {
            return Err(BrokerError::NotFound {
                key: key.to_string(),
            });
        }
        let bytes = match tokio::fs::read(self.result_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BrokerError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(BrokerError::io(format!("failed to read result {key}"), e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| BrokerError::Codec {
            message: format!("failed to decode result {key}: {e}"),
        })
    }

    async fn delete_result(&self, key: &str) -> Result<bool, BrokerError> {
        if !is_valid_key(key) {
            return Ok(false);
        }
        match tokio::fs::remove_file(self.result_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BrokerError::io(format!("failed to delete result {key}"), e)),
        }
    }
}

fn check_name(what: &str, name: &str) -> Result<(), BrokerError> {
    if is_valid_key(name) {
        Ok(())
    } else {
        Err(BrokerError::Codec {
            message: format!("invalid {what}: {name:?}"),
        })
    }
}

fn encode(envelope: &FileEnvelope) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(envelope).map_err(|e| BrokerError::Codec {
        message: format!("failed to encode message: {e}"),
    })
}

/// Writes through a hidden temp file in the same directory, then renames.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BrokerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| BrokerError::io(format!("failed to write {}", tmp.display()), e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(BrokerError::io(
            format!("failed to commit {}", path.display()),
            e,
        ));
    }
    Ok(())
}

/// Lists visible entries of `dir`. With `files_only`, only `*.json` files.
async fn list_dir(dir: &Path, files_only: bool) -> Result<Vec<String>, BrokerError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BrokerError::io(format!("failed to list {}", dir.display()), e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BrokerError::io(format!("failed to list {}", dir.display()), e))?
    {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if files_only && !name.ends_with(MESSAGE_SUFFIX) {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}

async fn is_older_than(path: &Path, age: Duration) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().map(|e| e >= age).unwrap_or(true),
        Err(_) => false,
    }
}

/// Marks the moment of delivery on a claimed file.
async fn touch(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await?
        .into_std()
        .await;
    tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
        .await
        .map_err(std::io::Error::other)?
}
