//! Queue names and component defaults.

use std::time::Duration;

/// Work queue the dispatcher publishes to and workers consume from.
pub const DEFAULT_QUEUE: &str = "tasks";

/// Bound on each registry or broker call made on behalf of a caller.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Tasks executed concurrently by one worker loop.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// How long a worker waits on an empty queue before checking for shutdown.
pub const DEFAULT_DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Pause after a transport error in a background loop.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Time between garbage-collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// How long a terminal task stays readable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// `status_message` of tasks failed by the stale-task policy.
pub const STALE_TASK_MESSAGE: &str = "task exceeded the staleness threshold while running";
