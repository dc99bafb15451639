use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::retry::ErrorKind;
use crate::types::{DispatchOutcome, Purpose};

/// Running dispatch counters, shared between the dispatcher and its callers
#[derive(Debug, Default)]
pub struct DispatchStats {
    // Logical sends
    pub sends_started: AtomicU64,
    pub sends_succeeded: AtomicU64,
    pub sends_failed: AtomicU64,

    // Individual attempts
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub gas_escalations: AtomicU64,
    pub nonce_resyncs: AtomicU64,

    // Terminal failures by kind
    pub failed_underpriced: AtomicU64,
    pub failed_nonce: AtomicU64,
    pub failed_funds: AtomicU64,
    pub failed_timeout: AtomicU64,
    pub failed_other: AtomicU64,

    // Per purpose successes
    pub funded: AtomicU64,
    pub transfers: AtomicU64,
    pub blasts: AtomicU64,

    // Batches
    pub batches_completed: AtomicU64,
    pub batches_failed: AtomicU64,

    pub send_total_time_ms: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Fold a terminal outcome into the counters
    pub fn record_outcome(&self, outcome: &DispatchOutcome, elapsed: Duration) {
        self.add(&self.send_total_time_ms, elapsed.as_millis() as u64);
        if outcome.attempts > 1 {
            self.add(&self.retries, (outcome.attempts - 1) as u64);
        }

        match &outcome.error {
            None => {
                self.increment(&self.sends_succeeded);
                match outcome.purpose {
                    Purpose::Funding => self.increment(&self.funded),
                    Purpose::Transfer => self.increment(&self.transfers),
                    Purpose::Blast => self.increment(&self.blasts),
                }
            }
            Some(failure) => {
                self.increment(&self.sends_failed);
                let counter = match failure.kind {
                    ErrorKind::Underpriced => &self.failed_underpriced,
                    ErrorKind::NonceConflict => &self.failed_nonce,
                    ErrorKind::InsufficientFunds => &self.failed_funds,
                    ErrorKind::ConfirmationTimeout => &self.failed_timeout,
                    _ => &self.failed_other,
                };
                self.increment(counter);
            }
        }
    }

    pub fn completed(&self) -> u64 {
        self.get(&self.sends_succeeded) + self.get(&self.sends_failed)
    }

    /// Average wall time of a logical send, including retries
    pub fn avg_send_time_ms(&self) -> f64 {
        let count = self.completed();
        if count == 0 {
            return 0.0;
        }
        self.get(&self.send_total_time_ms) as f64 / count as f64
    }

    /// Percentage of completed sends that succeeded
    pub fn success_rate(&self) -> f64 {
        let count = self.completed();
        if count == 0 {
            return 0.0;
        }
        self.get(&self.sends_succeeded) as f64 * 100.0 / count as f64
    }

    pub fn reset(&self) {
        for counter in [
            &self.sends_started,
            &self.sends_succeeded,
            &self.sends_failed,
            &self.attempts,
            &self.retries,
            &self.gas_escalations,
            &self.nonce_resyncs,
            &self.failed_underpriced,
            &self.failed_nonce,
            &self.failed_funds,
            &self.failed_timeout,
            &self.failed_other,
            &self.funded,
            &self.transfers,
            &self.blasts,
            &self.batches_completed,
            &self.batches_failed,
            &self.send_total_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Log a summary, with throughput measured from `since`
    pub fn log_summary(&self, label: &str, since: Instant) {
        let elapsed = since.elapsed().as_secs_f64();
        let succeeded = self.get(&self.sends_succeeded);
        let tps = if elapsed > 0.0 {
            succeeded as f64 / elapsed
        } else {
            0.0
        };

        tracing::info!("[Stats] {} | {:.1}s elapsed | {:.2} TPS", label, elapsed, tps);
        tracing::info!(
            "        Sends: {} started, {} succeeded, {} failed ({:.1}% ok, avg {:.1}ms)",
            self.get(&self.sends_started),
            succeeded,
            self.get(&self.sends_failed),
            self.success_rate(),
            self.avg_send_time_ms()
        );
        tracing::info!(
            "        Attempts: {} total, {} retries, {} gas escalations, {} nonce resyncs",
            self.get(&self.attempts),
            self.get(&self.retries),
            self.get(&self.gas_escalations),
            self.get(&self.nonce_resyncs)
        );
        tracing::info!(
            "        Failed: underpriced {}, nonce {}, funds {}, timeout {}, other {}",
            self.get(&self.failed_underpriced),
            self.get(&self.failed_nonce),
            self.get(&self.failed_funds),
            self.get(&self.failed_timeout),
            self.get(&self.failed_other)
        );
        tracing::info!(
            "        By purpose: {} funded, {} transfers, {} blasts | Batches: {} ok, {} failed",
            self.get(&self.funded),
            self.get(&self.transfers),
            self.get(&self.blasts),
            self.get(&self.batches_completed),
            self.get(&self.batches_failed)
        );
    }
}
