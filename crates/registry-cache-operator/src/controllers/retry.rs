//! Requeue policy for failed reconciles
//!
//! Errors are classified as transient or permanent. Transient failures are
//! requeued with a capped exponential delay counted per resource, permanent
//! ones wait for the resource to change.

use std::collections::HashMap;
use std::time::Duration;

use kube::runtime::controller::Action;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Transient failures retried before waiting for a change
const MAX_RETRIES: u32 = 10;

const BASE_DELAY_SECS: u64 = 5;

const MAX_DELAY_SECS: u64 = 3600;

/// Consecutive failures per resource UID
#[derive(Debug, Default)]
pub struct RetryTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the retry count of a resource and return the new count
    pub fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.failures.lock();
        let failures = attempts.entry(uid.to_string()).or_default();
        *failures += 1;
        *failures
    }

    /// Forget a resource, after a successful reconcile or its deletion
    pub fn reset(&self, uid: &str) {
        self.failures.lock().remove(uid);
    }

    pub fn get(&self, uid: &str) -> u32 {
        self.failures.lock().get(uid).copied().unwrap_or(0)
    }
}

/// How a failure is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected to recover on its own: API failures, caches not yet reachable
    Transient,
    /// Needs a change of the resource: invalid configuration
    Permanent,
}

/// Delay before the next delivery of a failed resource
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_secs = BASE_DELAY_SECS.saturating_mul(2u64.pow(exponent));
    Duration::from_secs(delay_secs.min(MAX_DELAY_SECS))
}

/// Requeue action after the `attempt`-th consecutive failure
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient if attempt >= MAX_RETRIES => {
            warn!(
                attempt,
                max_retries = MAX_RETRIES,
                "Giving up on requeues until the resource changes"
            );
            Action::await_change()
        }
        ErrorKind::Transient => {
            let delay = backoff_delay(attempt);
            debug!(
                attempt,
                delay_secs = delay.as_secs(),
                "Requeueing after transient failure"
            );
            Action::requeue(delay)
        }
        ErrorKind::Permanent => {
            warn!("Failure needs a spec change, not requeueing");
            Action::await_change()
        }
    }
}
