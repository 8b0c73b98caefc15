//! Post-commit refresh of a directory listing.
//!
//! The host's contents endpoint lags behind a ref update, so a listing
//! fetched right after a commit can still show the old tree.  The reconciler
//! waits, fetches once, and if that fails waits longer and fetches one last
//! time.  Two failures leave the caller's current listing in place; staleness
//! is logged, never surfaced as an error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ReconcileConfig;
use crate::metrics::{MetricsRegistry, ReconcileResult};

/// Result of a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled<T> {
    /// A fetch succeeded on attempt `attempt` (1 or 2).
    Fresh { value: T, attempt: u8 },
    /// Both fetches failed; keep showing what was there.
    Stale,
}

#[derive(Clone)]
pub struct Reconciler {
    first_delay: Duration,
    second_delay: Duration,
    metrics: MetricsRegistry,
}

impl Reconciler {
    pub fn new(first_delay: Duration, second_delay: Duration, metrics: MetricsRegistry) -> Self {
        Self {
            first_delay,
            second_delay,
            metrics,
        }
    }

    pub fn from_config(config: &ReconcileConfig, metrics: MetricsRegistry) -> Self {
        Self::new(
            Duration::from_millis(config.first_delay_ms),
            Duration::from_millis(config.second_delay_ms),
            metrics,
        )
    }

    /// Run `fetch` after the first delay and, only if it fails, once more
    /// after the second delay.
    pub async fn reconcile<T, E, F, Fut>(&self, mut fetch: F) -> Reconciled<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::time::sleep(self.first_delay).await;
        let first = match fetch().await {
            Ok(value) => {
                self.metrics.metrics.record_reconcile(ReconcileResult::First);
                return Reconciled::Fresh { value, attempt: 1 };
            }
            Err(e) => e,
        };
        debug!(error = %first, retry_in_ms = self.second_delay.as_millis() as u64, "refresh failed, retrying");

        tokio::time::sleep(self.second_delay).await;
        match fetch().await {
            Ok(value) => {
                self.metrics.metrics.record_reconcile(ReconcileResult::Second);
                Reconciled::Fresh { value, attempt: 2 }
            }
            Err(e) => {
                self.metrics.metrics.record_reconcile(ReconcileResult::Stale);
                warn!(first = %first, second = %e, "listing refresh failed twice, keeping stale view");
                Reconciled::Stale
            }
        }
    }
}
