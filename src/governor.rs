//! Rate-limit governor for language-model calls.
//!
//! A process-wide shared resource with two knobs: a minimum inter-request
//! spacing per model (requests-per-minute inverted) and a global concurrency
//! ceiling. Callers [`admit`](RateGovernor::admit) before every call and hold
//! the returned permit for its duration. Each model has its own pacing clock;
//! all models share the concurrency pool, and waiters are served first-in
//! first-out.
//!
//! The governor also tracks consecutive failures per model and, past a
//! configurable threshold, reroutes subsequent requests to the declared
//! fallback model until the failing model succeeds again.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Errors from governor admission.
#[derive(Debug, Error, Diagnostic)]
pub enum GovernorError {
    #[error("governor concurrency pool closed")]
    #[diagnostic(code(delver::governor::closed))]
    Closed,
}

/// Tuning knobs for [`RateGovernor`].
#[derive(Clone, Debug)]
pub struct GovernorConfig {
    /// Requests per minute allowed per model; 0 disables pacing.
    pub requests_per_minute: u32,
    /// Ceiling on concurrently outstanding requests across all models.
    pub max_concurrent: usize,
    /// Consecutive failures of one model before the fallback takes over.
    pub failure_threshold: u32,
    /// Model substituted once the threshold trips.
    pub fallback_model: Option<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            max_concurrent: 4,
            failure_threshold: 3,
            fallback_model: None,
        }
    }
}

/// Permission to perform one rate-limited call.
///
/// Holds a slot in the global concurrency pool; dropping it frees the slot.
#[derive(Debug)]
pub struct GovernorPermit {
    _slot: OwnedSemaphorePermit,
}

#[derive(Default)]
struct PacingClocks {
    /// Next free send instant per model.
    next_slot: FxHashMap<String, Instant>,
}

#[derive(Default)]
struct FailureBook {
    consecutive: FxHashMap<String, u32>,
}

/// Process-wide pacing and concurrency control for LLM traffic.
pub struct RateGovernor {
    pool: Arc<Semaphore>,
    clocks: Mutex<PacingClocks>,
    failures: Mutex<FailureBook>,
    min_interval: Duration,
    failure_threshold: u32,
    fallback_model: Option<String>,
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("min_interval", &self.min_interval)
            .field("available_slots", &self.pool.available_permits())
            .finish()
    }
}

impl RateGovernor {
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        let min_interval = if config.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / f64::from(config.requests_per_minute))
        };
        Self {
            pool: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            clocks: Mutex::new(PacingClocks::default()),
            failures: Mutex::new(FailureBook::default()),
            min_interval,
            failure_threshold: config.failure_threshold.max(1),
            fallback_model: config.fallback_model,
        }
    }

    /// Wait for this model's pacing clock and a concurrency slot, then
    /// return the permit. Hold the permit for the duration of the call.
    ///
    /// Pacing sleeps happen before a pool slot is taken, so one model's
    /// clock cannot stall another model's calls through the shared pool.
    pub async fn admit(&self, model: &str) -> Result<GovernorPermit, GovernorError> {
        if !self.min_interval.is_zero() {
            // Reserve the next send slot under the lock, sleep outside it.
            // Waiters take slots in arrival order.
            let send_at = {
                let mut clocks = self.clocks.lock();
                let now = Instant::now();
                let slot_at = clocks
                    .next_slot
                    .get(model)
                    .copied()
                    .map_or(now, |at| at.max(now));
                clocks
                    .next_slot
                    .insert(model.to_string(), slot_at + self.min_interval);
                slot_at
            };
            tokio::time::sleep_until(send_at).await;
        }

        let slot = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| GovernorError::Closed)?;

        Ok(GovernorPermit { _slot: slot })
    }

    /// Record a successful call, resetting the model's failure streak.
    pub fn record_success(&self, model: &str) {
        self.failures.lock().consecutive.remove(model);
    }

    /// Record a failed call. Returns the streak length.
    pub fn record_failure(&self, model: &str) -> u32 {
        let mut book = self.failures.lock();
        let streak = book.consecutive.entry(model.to_string()).or_insert(0);
        *streak += 1;
        *streak
    }

    /// The model that should actually serve a request for `requested`:
    /// the fallback once the failure threshold has tripped, otherwise the
    /// requested model itself.
    #[must_use]
    pub fn resolve_model(&self, requested: &str) -> String {
        let Some(fallback) = &self.fallback_model else {
            return requested.to_string();
        };
        if fallback == requested {
            return requested.to_string();
        }
        let tripped = self
            .failures
            .lock()
            .consecutive
            .get(requested)
            .is_some_and(|streak| *streak >= self.failure_threshold);
        if tripped {
            fallback.clone()
        } else {
            requested.to_string()
        }
    }

    /// The configured fallback for `model`, if one exists and differs from
    /// `model`, regardless of its current failure streak.
    #[must_use]
    pub fn fallback_for(&self, model: &str) -> Option<String> {
        self.fallback_model
            .as_ref()
            .filter(|fallback| fallback.as_str() != model)
            .cloned()
    }

    /// Exponential backoff with jitter for retryable failures; rate-limited
    /// responses back off from a higher base.
    #[must_use]
    pub fn backoff_delay(attempt: u32, rate_limited: bool) -> Duration {
        let base_ms: u64 = if rate_limited { 2_000 } else { 500 };
        let exp = base_ms.saturating_mul(1_u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=exp / 4);
        Duration::from_millis((exp + jitter).min(60_000))
    }
}
