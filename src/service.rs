//! Assembles registry, broker and components from a [`ServiceConfig`].
//!
//! All handles returned by [`TaskService`] share the same registry and
//! broker, so a dispatcher, a worker and a collector built from one service
//! cooperate in-process. Separate processes cooperate through the
//! filesystem transport when they point at the same `base_folder`.

use std::sync::Arc;
use std::time::Duration;

use esg_tasks::broker::fs::FsBroker;
use esg_tasks::broker::memory::InMemoryBroker;
use esg_tasks::broker::BrokerTransport;
use esg_tasks::store::fs::{FsBackend, FsTaskRegistry};
use esg_tasks::store::memory::{InMemoryBackend, InMemoryTaskRegistry};
use esg_tasks::store::TaskRegistry;
use esg_tasks::{Computations, Dispatcher, GarbageCollector, StatusReader, WorkerLoop};

use crate::config::{BrokerTransportKind, ServiceConfig};
use crate::error::ServiceError;

#[derive(Clone)]
enum Transport {
    Filesystem(Arc<FsBroker>),
    Memory(Arc<InMemoryBroker>),
}

impl Transport {
    fn shared(&self) -> Arc<dyn BrokerTransport> {
        match self {
            Self::Filesystem(broker) => broker.clone(),
            Self::Memory(broker) => broker.clone(),
        }
    }
}

/// Shared registry and broker plus the configuration to build components.
#[derive(Clone)]
pub struct TaskService {
    config: ServiceConfig,
    registry: Arc<dyn TaskRegistry>,
    transport: Transport,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("service", &self.config.service.name)
            .field("transport", &self.config.broker.transport)
            .finish_non_exhaustive()
    }
}

impl TaskService {
    /// Validates `config` and opens the registry and broker it names.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] for invalid configuration,
    /// [`ServiceError::Storage`] or [`ServiceError::Broker`] when the
    /// filesystem directories cannot be created.
    pub async fn from_config(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let (registry, transport): (Arc<dyn TaskRegistry>, Transport) =
            match config.broker.transport {
                BrokerTransportKind::Filesystem => {
                    let backend = FsBackend::open(config.registry_folder()).await?;
                    let broker = FsBroker::open(config.broker_folder()).await?;
                    (
                        Arc::new(FsTaskRegistry::new(backend)),
                        Transport::Filesystem(Arc::new(broker)),
                    )
                }
                BrokerTransportKind::Memory => (
                    Arc::new(InMemoryTaskRegistry::new(InMemoryBackend::new())),
                    Transport::Memory(Arc::new(InMemoryBroker::new())),
                ),
            };

        tracing::info!(
            service = %config.service.name,
            version = %config.service.version,
            transport = %config.broker.transport,
            base_folder = %config.broker.base_folder.display(),
            "task service opened"
        );

        Ok(Self {
            config,
            registry,
            transport,
        })
    }

    /// The configuration the service was built from.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The shared registry.
    pub fn registry(&self) -> Arc<dyn TaskRegistry> {
        self.registry.clone()
    }

    /// The shared broker.
    pub fn broker(&self) -> Arc<dyn BrokerTransport> {
        self.transport.shared()
    }

    /// API-side submission handle.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.registry(), self.broker())
            .with_queue(self.config.worker.queue.clone())
            .with_call_timeout(self.config.call_timeout())
            .with_enabled_kinds(self.config.enabled_kinds())
    }

    /// API-side status and result handle.
    pub fn reader(&self) -> StatusReader {
        StatusReader::new(self.registry(), self.broker()).with_config(self.config.reader_config())
    }

    /// A worker executing `computations`.
    pub fn worker(&self, computations: Computations) -> WorkerLoop {
        WorkerLoop::new(self.registry(), self.broker(), computations)
            .with_config(self.config.worker_config())
    }

    /// The retention sweeper.
    pub fn garbage_collector(&self) -> Result<GarbageCollector, ServiceError> {
        Ok(GarbageCollector::new(self.registry(), self.broker())
            .with_config(self.config.gc_config()?))
    }

    /// Returns deliveries left unacknowledged by crashed workers to the
    /// queue.
    ///
    /// The filesystem transport only touches deliveries claimed at least
    /// `older_than` ago; the in-memory transport recovers everything.
    pub async fn recover_unacked(&self, older_than: Duration) -> Result<usize, ServiceError> {
        let recovered = match &self.transport {
            Transport::Filesystem(broker) => broker.recover_unacked(older_than).await?,
            Transport::Memory(broker) => broker.recover_unacked(),
        };
        if recovered > 0 {
            tracing::warn!(recovered, "returned unacknowledged deliveries to the queue");
        }
        Ok(recovered)
    }
}
