//! Adaptive, fair request pacing shared across every running job.
//!
//! Each job owns one [`AdaptiveRateLimiter`] per remote provider. All limiters for the same
//! provider share one [`ActiveJobCounter`]; a limiter counts itself as active while it has
//! queued work, and every limiter paces itself to `1 / active` of the provider's budget.

use config_manager::{AnalysisConfig, ProviderLimits};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Number of limiter instances that currently have queued work.
#[derive(Debug, Default)]
pub struct ActiveJobCounter {
    active: AtomicUsize,
}

impl ActiveJobCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Delay to hold between two units of work when `active_jobs` share the provider.
pub fn compute_delay(limits: &ProviderLimits, active_jobs: usize) -> Duration {
    let active = active_jobs.max(1) as f64;
    let effective_rps =
        (limits.max_requests_per_second * limits.target_usage_percent / 100.0) / active;

    let raw_ms = if effective_rps > 0.0 {
        1000.0 / effective_rps
    } else {
        limits.max_delay_ms as f64
    };
    let clamped = raw_ms.clamp(limits.min_delay_ms as f64, limits.max_delay_ms as f64);
    Duration::from_millis(clamped.round() as u64)
}

/// Transactions per batch such that one batch fits the wall-clock target at the current load.
///
/// Shrinks as load grows and never leaves `[min_batch_size, max_batch_size]`.
pub fn optimal_batch_size(
    active_jobs: usize,
    limits: &ProviderLimits,
    analysis: &AnalysisConfig,
) -> usize {
    let per_call = compute_delay(limits, active_jobs).as_secs_f64();
    let calls_per_tx = analysis.calls_per_transaction.max(f64::EPSILON);
    let seconds_per_tx = per_call * calls_per_tx;

    let fits = if seconds_per_tx > 0.0 {
        (analysis.target_batch_seconds as f64 / seconds_per_tx).floor() as usize
    } else {
        analysis.max_batch_size
    };
    fits.clamp(analysis.min_batch_size, analysis.max_batch_size)
}

/// Timeout for a unit expected to make `expected_calls` paced calls.
pub fn recommended_timeout(
    expected_calls: usize,
    active_jobs: usize,
    limits: &ProviderLimits,
    analysis: &AnalysisConfig,
) -> Duration {
    let per_call = compute_delay(limits, active_jobs);
    let budget = per_call
        .saturating_mul(u32::try_from(expected_calls.max(1)).unwrap_or(u32::MAX))
        .saturating_mul(2);
    budget.clamp(
        Duration::from_secs(analysis.min_batch_timeout_seconds),
        Duration::from_secs(analysis.max_batch_timeout_seconds),
    )
}

/// Per-job pacing for one provider.
pub struct AdaptiveRateLimiter {
    name: String,
    limits: ProviderLimits,
    counter: Arc<ActiveJobCounter>,
    pending: AtomicUsize,
    /// Earliest instant the next unit may start; holding the lock serializes units.
    next_slot: Mutex<Option<Instant>>,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, limits: ProviderLimits, counter: Arc<ActiveJobCounter>) -> Self {
        Self {
            name: name.into(),
            limits,
            counter,
            pending: AtomicUsize::new(0),
            next_slot: Mutex::new(None),
        }
    }

    /// Delay this limiter would currently apply between units.
    pub fn current_delay(&self) -> Duration {
        compute_delay(&self.limits, self.counter.get())
    }

    /// Queue `operation` behind any earlier unit of this limiter and run it when paced.
    pub async fn schedule<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.schedule_weighted(1, operation).await
    }

    /// Schedule a unit that sends `requests` calls at once; the pause after it is one
    /// delay per call.
    pub async fn schedule_weighted<F, Fut, T>(&self, requests: usize, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _pending = PendingGuard::enter(self);

        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            tokio::time::sleep_until(at).await;
        }

        let result = operation().await;

        let weight = u32::try_from(requests.max(1)).unwrap_or(u32::MAX);
        let delay = self.current_delay().saturating_mul(weight);
        debug!(
            "{}: next unit in {}ms ({} calls, {} active)",
            self.name,
            delay.as_millis(),
            weight,
            self.counter.get()
        );
        *next_slot = Some(Instant::now() + delay);
        result
    }
}

/// Tracks queue occupancy, including units dropped mid-flight by a timeout.
struct PendingGuard<'a> {
    limiter: &'a AdaptiveRateLimiter,
}

impl<'a> PendingGuard<'a> {
    fn enter(limiter: &'a AdaptiveRateLimiter) -> Self {
        if limiter.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            limiter.counter.increment();
        }
        Self { limiter }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.limiter.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.limiter.counter.decrement();
        }
    }
}
