use crate::add_millis;
use chrono::{DateTime, Utc};
use esc_core::{BreakerSnapshot, CompactionReport, DeliveryCounters, MetricsSnapshot};
use esc_storage::EscalationStore;
use tracing::{info, warn};

pub const SNAPSHOT_SOURCE: &str = "worker";

/// Tracks time since the last captured snapshot. The first check is always due.
#[derive(Debug, Clone)]
pub struct SnapshotCadence {
    interval_ms: u64,
    last_capture_at: Option<DateTime<Utc>>,
}

impl SnapshotCadence {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_capture_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_capture_at {
            None => true,
            Some(last) => add_millis(last, self.interval_ms).map_or(false, |next| now >= next),
        }
    }

    pub fn mark(&mut self, now: DateTime<Utc>) {
        self.last_capture_at = Some(now);
    }

    pub fn last_capture_at(&self) -> Option<DateTime<Utc>> {
        self.last_capture_at
    }
}

/// Best-effort: a failed write is logged and reported as `false`.
pub fn capture_snapshot(
    store: &EscalationStore,
    now: DateTime<Utc>,
    counters: DeliveryCounters,
    breaker: &BreakerSnapshot,
) -> bool {
    let snapshot = MetricsSnapshot::capture(now, counters, breaker, SNAPSHOT_SOURCE);
    match store.insert_metrics_snapshot(&snapshot) {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "snapshot_capture_failed", error = %err);
            false
        }
    }
}

/// Runs rollup compaction, swallowing failures after logging them.
pub fn compact(
    store: &EscalationStore,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Option<CompactionReport> {
    match store.compact_metrics(now, retention_days) {
        Ok(report) => {
            info!(
                event = "compaction_completed",
                cutoff = ?report.cutoff,
                snapshots = report.snapshots_compacted,
                hourly_buckets = report.hourly_buckets,
                daily_buckets = report.daily_buckets
            );
            Some(report)
        }
        Err(err) => {
            warn!(event = "compaction_failed", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use esc_core::BreakerState;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn cadence_is_due_first_then_after_interval() {
        let mut cadence = SnapshotCadence::new(60_000);
        assert!(cadence.is_due(ts(0)));
        cadence.mark(ts(0));
        assert!(!cadence.is_due(ts(59_999)));
        assert!(cadence.is_due(ts(60_000)));
        assert_eq!(cadence.last_capture_at(), Some(ts(0)));
    }

    #[test]
    fn capture_writes_counters_and_breaker_state() {
        let store = EscalationStore::open_in_memory().expect("open db");
        let breaker = BreakerSnapshot {
            state: BreakerState::Open,
            failure_count: 0,
            opened_at: Some(ts(-1_000)),
            open_until: Some(ts(59_000)),
            remaining_ms: 59_000,
            probe_in_flight: false,
        };
        let counters = DeliveryCounters {
            attempted: 3,
            failed: 3,
            ..DeliveryCounters::default()
        };

        assert!(capture_snapshot(&store, ts(0), counters, &breaker));
        let stored = store
            .latest_metrics_snapshot()
            .expect("query")
            .expect("snapshot");
        assert_eq!(stored.counters, counters);
        assert_eq!(stored.breaker_state, BreakerState::Open);
        assert_eq!(stored.breaker_remaining_ms, 59_000);
        assert_eq!(stored.source, SNAPSHOT_SOURCE);
    }

    #[test]
    fn compaction_failure_is_swallowed() {
        let store = EscalationStore::open_in_memory().expect("open db");
        assert!(compact(&store, ts(0), u32::MAX).is_none());
        assert!(compact(&store, ts(0), 14).is_some());
    }
}
