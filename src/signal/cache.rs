//! TTL-bounded cache of one externally polled value.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to wait after a failed refresh before trying again.
///
/// Zero: a failed refresh leaves the fetch timestamp untouched, so the value
/// stays stale and the very next `get()` retries.
pub const FAILED_REFRESH_RETRY_DELAY: Duration = Duration::ZERO;

/// Upstream a [`SignalCache`] polls.
#[async_trait]
pub trait SignalSource: Send + Sync + 'static {
    /// Served before the first successful fetch.
    type Value: Default + Send + Sync + 'static;

    /// Short name used in logs.
    fn describe(&self) -> String;

    async fn fetch(&self) -> anyhow::Result<Self::Value>;
}

struct Snapshot<T> {
    value: Arc<T>,
    fetched_at: Option<Instant>,
    failed_at: Option<Instant>,
}

pub struct SignalCache<S: SignalSource> {
    source: S,
    ttl: Duration,
    request_timeout: Duration,
    snapshot: RwLock<Snapshot<S::Value>>,
    /// Held for the duration of a refresh; at most one fetch is ever in flight.
    refresh: tokio::sync::Mutex<()>,
}

impl<S: SignalSource> SignalCache<S> {
    pub fn new(source: S, ttl: Duration, request_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            request_timeout,
            snapshot: RwLock::new(Snapshot {
                value: Arc::new(S::Value::default()),
                fetched_at: None,
                failed_at: None,
            }),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Last known value, refreshed first if stale.
    ///
    /// Never returns an error and never waits longer than the request timeout.
    /// Callers that arrive while another caller is refreshing get the current
    /// value immediately.
    pub async fn get(&self) -> Arc<S::Value> {
        let (current, stale) = self.peek(Instant::now());
        if !stale {
            return current;
        }

        let Ok(_guard) = self.refresh.try_lock() else {
            return current;
        };
        // Another caller may have finished a refresh between peek and lock.
        let (current, stale) = self.peek(Instant::now());
        if !stale {
            return current;
        }

        let started = Instant::now();
        match tokio::time::timeout(self.request_timeout, self.source.fetch()).await {
            Ok(Ok(value)) => {
                let value = Arc::new(value);
                let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                snapshot.value = value.clone();
                snapshot.fetched_at = Some(Instant::now());
                snapshot.failed_at = None;
                debug!(source = %self.source.describe(), "Refreshed signal");
                value
            }
            Ok(Err(e)) => {
                warn!(source = %self.source.describe(), "Signal refresh failed, serving last value: {e:#}");
                self.mark_failed(started);
                current
            }
            Err(_) => {
                warn!(
                    source = %self.source.describe(),
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Signal refresh timed out, serving last value"
                );
                self.mark_failed(started);
                current
            }
        }
    }

    fn peek(&self, now: Instant) -> (Arc<S::Value>, bool) {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        let expired = snapshot
            .fetched_at
            .map_or(true, |at| now.duration_since(at) >= self.ttl);
        let backing_off = snapshot
            .failed_at
            .is_some_and(|at| now.duration_since(at) < FAILED_REFRESH_RETRY_DELAY);
        (snapshot.value.clone(), expired && !backing_off)
    }

    fn mark_failed(&self, at: Instant) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .failed_at = Some(at);
    }
}
