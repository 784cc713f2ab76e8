use crate::breaker::{Admission, CircuitBreaker};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::metrics::{self, SnapshotCadence};
use crate::{BackoffPolicy, RelayConfig, RelayError};
use chrono::{DateTime, Utc};
use esc_core::{BreakerSnapshot, DeliveryCounters};
use esc_storage::{DeliveryCandidate, EscalationStore};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

pub const INVALID_PAYLOAD_ERROR: &str = "invalid_payload";

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub snapshot_interval_ms: u64,
}

impl From<&RelayConfig> for WorkerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            backoff: config.backoff,
            max_attempts: config.max_attempts,
            batch_size: config.batch_size,
            snapshot_interval_ms: config.snapshot_interval_ms,
        }
    }
}

/// What a single pass did. Counter fields are per pass; the worker's
/// cumulative counters live in [`DeliveryWorker::counters`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub candidates: usize,
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub skipped_backoff: u64,
    pub skipped_breaker: u64,
    pub none_pending: bool,
    pub snapshot_captured: bool,
}

/// Polling delivery worker. Owns the breaker, the cumulative counters and the
/// snapshot cadence; passes are serialised by an explicit running flag.
pub struct DeliveryWorker {
    store: Arc<EscalationStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: WorkerConfig,
    breaker: Mutex<CircuitBreaker>,
    counters: Mutex<DeliveryCounters>,
    cadence: Mutex<SnapshotCadence>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<EscalationStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config: WorkerConfig::from(config),
            breaker: Mutex::new(CircuitBreaker::new(config.breaker)),
            counters: Mutex::new(DeliveryCounters::default()),
            cadence: Mutex::new(SnapshotCadence::new(config.snapshot_interval_ms)),
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<EscalationStore> {
        &self.store
    }

    pub fn counters(&self) -> DeliveryCounters {
        *lock(&self.counters)
    }

    pub fn breaker_snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        lock(&self.breaker).snapshot(now)
    }

    pub fn reset_breaker(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let mut breaker = lock(&self.breaker);
        breaker.reset();
        breaker.snapshot(now)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one pass unless another is in flight, in which case the trigger is
    /// dropped and `None` is returned.
    pub async fn try_run_pass(&self, now: DateTime<Utc>) -> Option<Result<PassReport, RelayError>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(event = "pass_skipped_running");
            return None;
        }
        let _guard = RunningGuard(&self.running);
        Some(self.run_pass(now).await)
    }

    async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, RelayError> {
        let mut report = PassReport::default();

        let candidates = self
            .store
            .pending_deliveries(self.config.batch_size, self.config.max_attempts)
            .map_err(|err| {
                error!(event = "pass_aborted", stage = "select", error = %err);
                RelayError::from(err)
            })?;
        report.candidates = candidates.len();

        if candidates.is_empty() {
            lock(&self.counters).skipped_none_pending += 1;
            report.none_pending = true;
            debug!(event = "no_pending_deliveries");
        }

        report.snapshot_captured = self.maybe_capture_snapshot(now);

        let mut breaker_skip_counted = false;
        for candidate in &candidates {
            let delivery = &candidate.delivery;

            if !self
                .config
                .backoff
                .is_eligible(delivery.last_attempt_at, delivery.attempt_count, now)
            {
                lock(&self.counters).skipped_backoff += 1;
                report.skipped_backoff += 1;
                continue;
            }

            let admission = lock(&self.breaker).can_attempt(now);
            if !admission.is_allowed() {
                if !breaker_skip_counted {
                    lock(&self.counters).skipped_breaker += 1;
                    report.skipped_breaker += 1;
                    breaker_skip_counted = true;
                }
                continue;
            }

            let attempt = match self.store.begin_attempt(&delivery.id, now) {
                Ok(Some(attempt)) => attempt,
                Ok(None) => {
                    self.release_probe(admission);
                    debug!(event = "delivery_no_longer_pending", delivery_id = %delivery.id);
                    continue;
                }
                Err(err) => {
                    self.release_probe(admission);
                    error!(
                        event = "pass_aborted",
                        stage = "begin_attempt",
                        delivery_id = %delivery.id,
                        error = %err
                    );
                    return Err(err.into());
                }
            };
            lock(&self.counters).attempted += 1;
            report.attempted += 1;

            let outcome = match parse_payload(candidate) {
                Some(payload) => self.dispatcher.dispatch(&payload).await,
                None => DispatchOutcome::Failed(INVALID_PAYLOAD_ERROR.to_string()),
            };

            let persisted = match outcome {
                DispatchOutcome::Delivered => {
                    lock(&self.breaker).on_success(now);
                    lock(&self.counters).delivered += 1;
                    report.delivered += 1;
                    info!(
                        event = "delivery_succeeded",
                        delivery_id = %delivery.id,
                        attempt
                    );
                    self.store.mark_delivered(&delivery.id, now)
                }
                DispatchOutcome::Failed(reason) => {
                    lock(&self.breaker).on_failure(now);
                    lock(&self.counters).failed += 1;
                    report.failed += 1;
                    warn!(
                        event = "delivery_attempt_failed",
                        delivery_id = %delivery.id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %reason
                    );
                    self.store.mark_failed(&delivery.id, &reason)
                }
            };

            if let Err(err) = persisted {
                error!(
                    event = "pass_aborted",
                    stage = "record_outcome",
                    delivery_id = %delivery.id,
                    error = %err
                );
                return Err(err.into());
            }
        }

        info!(
            event = "pass_completed",
            candidates = report.candidates,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            skipped_backoff = report.skipped_backoff,
            skipped_breaker = report.skipped_breaker
        );
        Ok(report)
    }

    fn maybe_capture_snapshot(&self, now: DateTime<Utc>) -> bool {
        if !lock(&self.cadence).is_due(now) {
            return false;
        }
        let counters = self.counters();
        let breaker = self.breaker_snapshot(now);
        let captured = metrics::capture_snapshot(&self.store, now, counters, &breaker);
        if captured {
            lock(&self.cadence).mark(now);
        }
        captured
    }

    fn release_probe(&self, admission: Admission) {
        if admission == Admission::Probe {
            lock(&self.breaker).abandon_probe();
        }
    }
}

fn parse_payload(candidate: &DeliveryCandidate) -> Option<Value> {
    let raw = candidate.payload_json.as_deref()?;
    match serde_json::from_str(raw) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(
                event = "delivery_payload_invalid",
                delivery_id = %candidate.delivery.id,
                error = %err
            );
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
