//! Upstream API rate-limit tracking.
//!
//! Every forge response carries `X-RateLimit-Remaining` / `X-RateLimit-Reset`
//! (or the IETF `RateLimit-*` spelling).  The commit pipeline issues
//! `N + 5` calls for an `N`-file batch, so before each call the backend checks
//! the last observed window and sleeps until reset rather than burning the
//! remaining quota halfway through an attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::{debug, info};

/// Snapshot of the most recently observed rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub remaining: u64,
    /// Unix timestamp (seconds) at which `remaining` is replenished.
    pub reset_at: u64,
}

/// Shared rate-limit state updated after every forge API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    remaining: Arc<AtomicU64>,
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    /// No window observed yet: unlimited until the first response says
    /// otherwise.
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn window(&self) -> Window {
        Window {
            remaining: self.remaining.load(Ordering::Relaxed),
            reset_at: self.reset_at.load(Ordering::Relaxed),
        }
    }

    /// Record the window advertised by a response.  Returns the remaining
    /// count if the response carried one.
    pub fn observe(&self, headers: &HeaderMap) -> Option<u64> {
        let remaining = header_u64(headers, "X-RateLimit-Remaining", "RateLimit-Remaining");
        let reset = header_u64(headers, "X-RateLimit-Reset", "RateLimit-Reset");

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
        remaining
    }

    /// How long the caller should wait before its next call, given that it
    /// wants to keep `buffer` calls in reserve.
    pub fn backoff(&self, buffer: u32, now: u64) -> Option<Duration> {
        let Window { remaining, reset_at } = self.window();
        if remaining == u64::MAX || remaining >= u64::from(buffer) {
            return None;
        }
        if reset_at <= now {
            return None;
        }
        Some(Duration::from_secs(reset_at - now))
    }

    /// Sleep until the window resets if fewer than `buffer` calls remain.
    /// Returns `true` if the caller had to wait.
    pub async fn throttle(&self, buffer: u32) -> bool {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        match self.backoff(buffer, now) {
            Some(wait) => {
                info!(
                    remaining = self.remaining.load(Ordering::Relaxed),
                    reset_in_secs = wait.as_secs(),
                    buffer,
                    "self-throttling: rate limit approaching"
                );
                tokio::time::sleep(wait).await;
                true
            }
            None => {
                debug!(buffer, "rate limit OK");
                false
            }
        }
    }
}

fn header_u64(headers: &HeaderMap, primary: &str, fallback: &str) -> Option<u64> {
    headers
        .get(primary)
        .or_else(|| headers.get(fallback))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
