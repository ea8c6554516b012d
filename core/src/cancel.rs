//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a shared flag backed by a `tokio::sync::watch`
//! channel, the same primitive the runtime uses for shutdown signals. Clones
//! observe the same flag. Nothing is interrupted preemptively: components check
//! the token at fixed points (before each event in a projector run, at
//! batch-assembly time in the write coalescer).

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cooperative cancellation flag.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
