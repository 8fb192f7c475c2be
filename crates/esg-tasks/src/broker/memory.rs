//! In-memory broker transport.
//!
//! Queues are `VecDeque`s behind one `parking_lot::Mutex`, never held across
//! an await. Blocking dequeues park on a [`tokio::sync::Notify`] that every
//! enqueue wakes, so idle consumers cost nothing. Delivered messages move to
//! an in-flight map until acknowledged; [`InMemoryBroker::recover_unacked`]
//! puts them back flagged as redelivered, which is what a real broker does
//! when a consumer dies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerError, BrokerTransport};
use crate::types::message::{Delivery, TaskMessage};

#[derive(Debug, Clone)]
struct Envelope {
    message: TaskMessage,
    redelivered: bool,
}

/// Single-process broker transport.
///
/// # Examples
///
/// ```
/// use esg_tasks::broker::memory::InMemoryBroker;
/// use esg_tasks::broker::BrokerTransport;
/// use esg_tasks::{TaskKind, TaskMessage};
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let broker = InMemoryBroker::new();
/// broker
///     .enqueue("tasks", &TaskMessage::new("t1", TaskKind::Request, json!({})))
///     .await
///     .unwrap();
///
/// let delivery = broker.dequeue("tasks", None).await.unwrap().unwrap();
/// assert_eq!(delivery.message.task_id, "t1");
/// assert!(!delivery.redelivered);
/// broker.ack(&delivery).await.unwrap();
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Envelope>>>,
    in_flight: DashMap<String, (String, Envelope)>,
    results: DashMap<String, Value>,
    notify: Notify,
    next_receipt: AtomicU64,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Delivered but unacknowledged messages, across all queues.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of stored results.
    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Returns every unacknowledged delivery to the front of its queue,
    /// flagged as redelivered. Returns how many were recovered.
    pub fn recover_unacked(&self) -> usize {
        let receipts: Vec<String> = self
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut recovered = 0;
        for receipt in receipts {
            if let Some((_, (queue, mut envelope))) = self.in_flight.remove(&receipt) {
                envelope.redelivered = true;
                self.queues
                    .lock()
                    .entry(queue)
                    .or_default()
                    .push_front(envelope);
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::debug!(recovered, "requeued unacknowledged deliveries");
            self.notify.notify_waiters();
        }
        recovered
    }

    fn pop(&self, queue: &str) -> Option<Delivery> {
        let envelope = self.queues.lock().get_mut(queue)?.pop_front()?;
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        let delivery = Delivery {
            queue: queue.to_string(),
            message: envelope.message.clone(),
            receipt: receipt.clone(),
            redelivered: envelope.redelivered,
        };
        self.in_flight
            .insert(receipt, (queue.to_string(), envelope));
        Some(delivery)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn enqueue(&self, queue: &str, message: &TaskMessage) -> Result<(), BrokerError> {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(Envelope {
                message: message.clone(),
                redelivered: false,
            });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            // Register interest before checking so an enqueue racing with
            // the check still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.pop(queue) {
                return Ok(Some(delivery));
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownReceipt {
                receipt: delivery.receipt.clone(),
            })
    }

    async fn store_result(&self, key: &str, payload: &Value) -> Result<(), BrokerError> {
        self.results.insert(key.to_string(), payload.clone());
        Ok(())
    }

    async fn fetch_result(&self, key: &str) -> Result<Value, BrokerError> {
        self.results
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete_result(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(self.results.remove(key).is_some())
    }
}
