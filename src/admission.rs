//! Per-domain admission control for page fetches.
//!
//! Every fetch acquires, in order, a slot for the target's registered domain,
//! then waits out the domain cool-down, then takes a slot in the global fetch
//! pool. Releasing the ticket stamps the domain's last-completion time
//! regardless of how the fetch ended, which is what the cool-down is measured
//! from. Waiters on the same domain are served first-in first-out by the
//! underlying semaphore.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use url::Url;

/// Errors from fetch admission.
#[derive(Debug, Error, Diagnostic)]
pub enum AdmissionError {
    #[error("admission pool closed")]
    #[diagnostic(code(delver::admission::closed))]
    Closed,

    #[error("url has no host: {url}")]
    #[diagnostic(code(delver::admission::no_host))]
    NoHost { url: String },
}

/// Tuning knobs for [`AdmissionController`].
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Global bound on concurrent fetches.
    pub global_limit: usize,
    /// Concurrent fetches allowed per registered domain.
    pub per_domain_limit: usize,
    /// Minimum gap between a fetch completion and the next fetch start
    /// against the same domain.
    pub cool_down: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_limit: 8,
            per_domain_limit: 1,
            cool_down: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct DomainGate {
    slots: Arc<Semaphore>,
    last_completion: Mutex<Option<Instant>>,
}

/// Permission to run one fetch. Dropping it releases both slots and stamps
/// the domain's completion time.
#[derive(Debug)]
pub struct FetchTicket {
    gate: Arc<DomainGate>,
    _domain_slot: OwnedSemaphorePermit,
    _global_slot: OwnedSemaphorePermit,
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        *self.gate.last_completion.lock() = Some(Instant::now());
    }
}

/// Bounds concurrent fetches per registered domain and overall.
pub struct AdmissionController {
    global: Arc<Semaphore>,
    gates: Mutex<FxHashMap<String, Arc<DomainGate>>>,
    per_domain_limit: usize,
    cool_down: Duration,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("per_domain_limit", &self.per_domain_limit)
            .field("cool_down", &self.cool_down)
            .field("available_global_slots", &self.global.available_permits())
            .finish()
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.global_limit.max(1))),
            gates: Mutex::new(FxHashMap::default()),
            per_domain_limit: config.per_domain_limit.max(1),
            cool_down: config.cool_down,
        }
    }

    /// Wait for domain and global capacity to fetch `url`.
    pub async fn admit(&self, url: &Url) -> Result<FetchTicket, AdmissionError> {
        let domain = domain_key(url).ok_or_else(|| AdmissionError::NoHost {
            url: url.to_string(),
        })?;
        let gate = self.gate_for(&domain);

        let domain_slot = Arc::clone(&gate.slots)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;

        if !self.cool_down.is_zero() {
            loop {
                let last_completion = *gate.last_completion.lock();
                match last_completion.map(|last| last + self.cool_down) {
                    Some(at) if at > Instant::now() => tokio::time::sleep_until(at).await,
                    _ => break,
                }
            }
        }

        let global_slot = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;

        Ok(FetchTicket {
            gate,
            _domain_slot: domain_slot,
            _global_slot: global_slot,
        })
    }

    fn gate_for(&self, domain: &str) -> Arc<DomainGate> {
        let mut gates = self.gates.lock();
        Arc::clone(gates.entry(domain.to_string()).or_insert_with(|| {
            Arc::new(DomainGate {
                slots: Arc::new(Semaphore::new(self.per_domain_limit)),
                last_completion: Mutex::new(None),
            })
        }))
    }
}

/// Registered-domain bucket key for a URL.
///
/// Host with any leading `www.` stripped, reduced to its last two labels.
/// A full public-suffix lookup is out of proportion for admission bucketing;
/// multi-part suffixes simply share a slightly wider bucket.
#[must_use]
pub fn domain_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        Some(host.to_string())
    } else {
        Some(labels[labels.len() - 2..].join("."))
    }
}
