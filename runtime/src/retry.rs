//! Restart policy with exponential backoff for whole projection runs.
//!
//! When a run fails (storage outage, rejected document, projector timeout)
//! the runner does not patch up individual events. It throws away in-flight
//! state and starts over from the last committed position. This module
//! decides whether and when that restart happens.
//!
//! # Example
//!
//! ```rust
//! use docfold_runtime::retry::{RestartPolicy, restart_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RestartPolicy::builder()
//!     .max_restarts(5)
//!     .min_backoff(Duration::from_millis(100))
//!     .max_backoff(Duration::from_secs(10))
//!     .build();
//!
//! let result = restart_with_backoff(
//!     &policy,
//!     |_attempt| async { Ok::<_, String>(42) },
//!     |_err: &String| true,
//! ).await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Restart policy configuration.
///
/// # Default Values
///
/// - `max_restarts`: 3
/// - `min_backoff`: 100ms
/// - `max_backoff`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each restart)
/// - `random_factor`: 0.2 (up to 20% extra delay)
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum number of restarts after the initial attempt
    pub max_restarts: usize,
    /// Delay before the first restart
    pub min_backoff: Duration,
    /// Cap for exponential backoff
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Fraction of random extra delay added to each backoff
    pub random_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RestartPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RestartPolicyBuilder {
        RestartPolicyBuilder {
            max_restarts: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            random_factor: 0.2,
        }
    }

    /// Restart immediately, up to `max_restarts` times.
    #[must_use]
    pub const fn immediate(max_restarts: usize) -> Self {
        Self {
            max_restarts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            random_factor: 0.0,
        }
    }

    /// Backoff before restart number `attempt` (0-indexed).
    ///
    /// `min_backoff * multiplier^attempt`, capped at `max_backoff`, then
    /// stretched by up to `random_factor`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        // Exponent is capped well below i32::MAX
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let exponent = attempt.min(64) as i32;

        let base = self.min_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = if self.random_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.random_factor)
        } else {
            0.0
        };

        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

/// Builder for [`RestartPolicy`].
#[derive(Debug, Clone)]
pub struct RestartPolicyBuilder {
    max_restarts: usize,
    min_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    random_factor: f64,
}

impl RestartPolicyBuilder {
    /// Set maximum number of restarts.
    #[must_use]
    pub const fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set delay before the first restart.
    #[must_use]
    pub const fn min_backoff(mut self, delay: Duration) -> Self {
        self.min_backoff = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the random extra delay fraction (0 disables jitter).
    #[must_use]
    pub const fn random_factor(mut self, random_factor: f64) -> Self {
        self.random_factor = random_factor;
        self
    }

    /// Build the [`RestartPolicy`].
    #[must_use]
    pub const fn build(self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            multiplier: self.multiplier,
            random_factor: self.random_factor,
        }
    }
}

/// Run `operation` and restart it on restartable errors.
///
/// `operation` receives the attempt number (0 for the first run). Errors for
/// which `is_restartable` returns `false` are returned immediately.
///
/// # Errors
///
/// Returns the last error once restarts are exhausted, or the first
/// non-restartable error.
pub async fn restart_with_backoff<F, Fut, T, E, P>(
    policy: &RestartPolicy,
    mut operation: F,
    is_restartable: P,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Run succeeded after restart");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_restartable(&err) {
                    tracing::warn!(error = %err, "Error is not restartable, failing immediately");
                    return Err(err);
                }

                if attempt >= policy.max_restarts {
                    tracing::error!(attempt, error = %err, "Run failed after max restarts");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Run failed, restarting"
                );
                metrics::counter!("projection.runner.restarts").increment(1);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = RestartPolicy::builder()
            .min_backoff(Duration::from_millis(100))
            .multiplier(2.0)
            .max_backoff(Duration::from_secs(10))
            .random_factor(0.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RestartPolicy::builder()
            .min_backoff(Duration::from_secs(1))
            .multiplier(10.0)
            .max_backoff(Duration::from_secs(2))
            .random_factor(0.0)
            .build();

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_random_factor() {
        let policy = RestartPolicy::builder()
            .min_backoff(Duration::from_millis(100))
            .random_factor(0.5)
            .build();

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn restarts_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));

        let result = restart_with_backoff(
            &RestartPolicy::immediate(3),
            |attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_restarts() {
        let counter = Arc::new(AtomicUsize::new(0));

        let result = restart_with_backoff(
            &RestartPolicy::immediate(2),
            |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("persistent failure")
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_restartable_error_fails_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));

        let result = restart_with_backoff(
            &RestartPolicy::immediate(5),
            |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("permanent error")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
