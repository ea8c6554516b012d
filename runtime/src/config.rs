//! Configuration for projection runs and batched document storage.
//!
//! # Example
//!
//! ```rust
//! use docfold_runtime::config::{EventBatchingStrategy, ProjectionConfig};
//! use docfold_runtime::retry::RestartPolicy;
//! use std::time::Duration;
//!
//! let config = ProjectionConfig::default()
//!     .with_projection_timeout(Duration::from_secs(5))
//!     .with_event_batching(EventBatchingStrategy::new(50, 4))
//!     .with_restart(Some(RestartPolicy::immediate(3)));
//!
//! assert_eq!(config.event_batching.parallelism, 4);
//! ```

use crate::retry::RestartPolicy;
use std::time::Duration;

/// How the runner slices the event stream and how wide the sequencer fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBatchingStrategy {
    /// Events read from the source per chunk
    pub batch_size: usize,
    /// Maximum number of document-id groups per sequencer wave
    pub parallelism: usize,
}

impl EventBatchingStrategy {
    /// Create a strategy. Zero values are raised to one.
    #[must_use]
    pub const fn new(batch_size: usize, parallelism: usize) -> Self {
        Self {
            batch_size: if batch_size == 0 { 1 } else { batch_size },
            parallelism: if parallelism == 0 { 1 } else { parallelism },
        }
    }
}

impl Default for EventBatchingStrategy {
    fn default() -> Self {
        Self::new(100, 10)
    }
}

/// Settings for one projection.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Deadline for a projector to answer a `project_events` request
    pub projection_timeout: Duration,
    /// Source chunking and sequencer fan-out
    pub event_batching: EventBatchingStrategy,
    /// Chunks the runner keeps in flight before waiting on the oldest
    pub max_in_flight_batches: usize,
    /// Restart policy for failed runs, `None` fails on the first error
    pub restart: Option<RestartPolicy>,
    /// Stop projectors that received nothing for this long
    pub projector_idle_timeout: Option<Duration>,
}

impl ProjectionConfig {
    /// Set the projector deadline
    #[must_use]
    pub const fn with_projection_timeout(mut self, timeout: Duration) -> Self {
        self.projection_timeout = timeout;
        self
    }

    /// Set chunking and fan-out
    #[must_use]
    pub const fn with_event_batching(mut self, strategy: EventBatchingStrategy) -> Self {
        self.event_batching = strategy;
        self
    }

    /// Set how many chunks may be in flight
    #[must_use]
    pub const fn with_max_in_flight_batches(mut self, batches: usize) -> Self {
        self.max_in_flight_batches = if batches == 0 { 1 } else { batches };
        self
    }

    /// Set the restart policy
    #[must_use]
    pub const fn with_restart(mut self, policy: Option<RestartPolicy>) -> Self {
        self.restart = policy;
        self
    }

    /// Set the projector idle timeout
    #[must_use]
    pub const fn with_projector_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.projector_idle_timeout = timeout;
        self
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            projection_timeout: Duration::from_secs(30),
            event_batching: EventBatchingStrategy::default(),
            max_in_flight_batches: 2,
            restart: Some(RestartPolicy::default()),
            projector_idle_timeout: None,
        }
    }
}

/// How the write coalescer assembles batches from its admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBatchingStrategy {
    /// Take whatever is queued, up to `n` writes, without waiting.
    BatchSize(usize),

    /// Wait up to `max_wait` for `max_items` writes.
    BatchWithin {
        /// Writes per batch
        max_items: usize,
        /// Longest wait after the first write of a batch arrived
        max_wait: Duration,
    },
}

impl StorageBatchingStrategy {
    /// Upper bound on writes per batch.
    #[must_use]
    pub const fn max_items(&self) -> usize {
        let n = match self {
            Self::BatchSize(n) => *n,
            Self::BatchWithin { max_items, .. } => *max_items,
        };
        if n == 0 { 1 } else { n }
    }
}

impl Default for StorageBatchingStrategy {
    fn default() -> Self {
        Self::BatchSize(100)
    }
}

/// Settings for [`BatchedDocumentStorage`](crate::coalescer::BatchedDocumentStorage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchedStorageConfig {
    /// Merged writes executing concurrently
    pub parallelism: usize,
    /// Batch assembly strategy
    pub strategy: StorageBatchingStrategy,
    /// Admission queue capacity; a full queue suspends writers
    pub queue_capacity: usize,
}

impl BatchedStorageConfig {
    /// Set write concurrency
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism == 0 { 1 } else { parallelism };
        self
    }

    /// Set the batching strategy
    #[must_use]
    pub const fn with_strategy(mut self, strategy: StorageBatchingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the admission queue capacity
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }
}

impl Default for BatchedStorageConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            strategy: StorageBatchingStrategy::default(),
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProjectionConfig::default();
        assert_eq!(config.projection_timeout, Duration::from_secs(30));
        assert_eq!(config.event_batching, EventBatchingStrategy::new(100, 10));
        assert_eq!(config.max_in_flight_batches, 2);
        assert!(config.restart.is_some());
        assert!(config.projector_idle_timeout.is_none());

        let storage = BatchedStorageConfig::default();
        assert_eq!(storage.parallelism, 1);
        assert_eq!(storage.strategy, StorageBatchingStrategy::BatchSize(100));
        assert_eq!(storage.queue_capacity, 1024);
    }

    #[test]
    fn zero_sizes_are_raised() {
        let strategy = EventBatchingStrategy::new(0, 0);
        assert_eq!(strategy.batch_size, 1);
        assert_eq!(strategy.parallelism, 1);
        assert_eq!(StorageBatchingStrategy::BatchSize(0).max_items(), 1);
        assert_eq!(ProjectionConfig::default().with_max_in_flight_batches(0).max_in_flight_batches, 1);
    }
}
