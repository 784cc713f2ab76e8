use chrono::{DateTime, Duration, SecondsFormat, Utc};
use esc_core::{
    BreakerState, CompactionReport, DeliveryCounters, DeliveryStatus, EscalationDelivery,
    MetricsRollup, MetricsSnapshot, OperationalEvent, RollupGranularity, Severity,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const ESCALATION_SCHEMA_VERSION: i64 = 2;

const DELIVERY_COLUMNS: &str = "delivery_id, event_id, dedupe_key, status, attempt_count, \
     last_attempt_at, last_error, sent_at, created_at";

const ROLLUP_COLUMNS: &str = "bucket_start, attempted, delivered, failed, skipped_breaker, \
     skipped_backoff, skipped_none_pending, breaker_open_count, sample_count, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store connection lock poisoned")]
    LockPoisoned,
    #[error("retention of {0} days reaches before the earliest representable time")]
    RetentionOutOfRange(u32),
}

/// Result of a ledger upsert. `inserted` is false when a row with the same
/// dedupe key already existed and was returned untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpsert {
    pub delivery: EscalationDelivery,
    pub inserted: bool,
}

/// A delivery selected for a worker pass together with the stored payload of
/// its owning event. `payload_json` is `None` if the event row is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryCandidate {
    pub delivery: EscalationDelivery,
    pub payload_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled(EscalationDelivery),
    AlreadyTerminal(DeliveryStatus),
    NotFound,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryBacklog {
    pub pending: u64,
    pub failed: u64,
    pub delivered: u64,
    pub canceled: u64,
}

/// SQLite-backed event log, escalation ledger and metrics store.
///
/// The connection sits behind a mutex so one store can be shared between the
/// event intake path and the delivery worker. Every method takes the lock for
/// the duration of a single statement or transaction.
pub struct EscalationStore {
    conn: Mutex<Connection>,
}

impl EscalationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > ESCALATION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: ESCALATION_SCHEMA_VERSION,
            });
        }

        let conn = self.conn()?;
        if current < 1 {
            let sql = include_str!("../migrations/0001_escalation_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_metrics_rollups.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()?
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn insert_event(&self, event: &OperationalEvent) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(&event.payload)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn()?.execute(
            "
            INSERT INTO operational_events (
                event_id,
                event_name,
                severity,
                source,
                correlation_id,
                environment,
                payload_json,
                payload_hash,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                event.id,
                event.event_name,
                event.severity.map(|severity| severity.as_str()),
                event.source,
                event.correlation_id,
                event.environment,
                payload_json,
                event.payload_hash,
                format_timestamp(event.created_at),
            ],
        )?;

        Ok(())
    }

    pub fn event(&self, event_id: &str) -> Result<Option<OperationalEvent>, StorageError> {
        let event = self
            .conn()?
            .query_row(
                "
                SELECT event_id, event_name, severity, source, correlation_id, environment,
                       payload_json, payload_hash, created_at
                FROM operational_events
                WHERE event_id = ?1
                ",
                [event_id],
                |row| {
                    let severity = row
                        .get::<_, Option<String>>(2)?
                        .and_then(|value| value.parse::<Severity>().ok());
                    let payload_json: String = row.get(6)?;
                    let payload = serde_json::from_str(&payload_json).map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err))
                    })?;

                    Ok(OperationalEvent {
                        id: row.get(0)?,
                        event_name: row.get(1)?,
                        severity,
                        source: row.get(3)?,
                        correlation_id: row.get(4)?,
                        environment: row.get(5)?,
                        payload,
                        payload_hash: row.get(7)?,
                        created_at: timestamp_column(row, 8)?,
                    })
                },
            )
            .optional()?;

        Ok(event)
    }

    pub fn event_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM operational_events", [], |row| {
                row.get(0)
            })?)
    }

    /// Create-if-absent keyed by `dedupe_key`. An existing row is returned as
    /// stored; none of its fields are touched.
    pub fn upsert_delivery(
        &self,
        candidate: &EscalationDelivery,
    ) -> Result<LedgerUpsert, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "
            INSERT INTO escalation_deliveries (
                delivery_id,
                event_id,
                dedupe_key,
                status,
                attempt_count,
                last_attempt_at,
                last_error,
                sent_at,
                created_at
            ) VALUES (?1, ?2, ?3, 'pending', 0, NULL, NULL, NULL, ?4)
            ON CONFLICT(dedupe_key) DO NOTHING
            ",
            params![
                candidate.id,
                candidate.event_id,
                candidate.dedupe_key,
                format_timestamp(candidate.created_at),
            ],
        )?;

        let delivery = conn.query_row(
            &format!("SELECT {DELIVERY_COLUMNS} FROM escalation_deliveries WHERE dedupe_key = ?1"),
            [&candidate.dedupe_key],
            delivery_from_row,
        )?;

        Ok(LedgerUpsert {
            delivery,
            inserted: changes > 0,
        })
    }

    pub fn delivery(&self, delivery_id: &str) -> Result<Option<EscalationDelivery>, StorageError> {
        let delivery = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM escalation_deliveries WHERE delivery_id = ?1"
                ),
                [delivery_id],
                delivery_from_row,
            )
            .optional()?;
        Ok(delivery)
    }

    pub fn delivery_by_dedupe_key(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<EscalationDelivery>, StorageError> {
        let delivery = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM escalation_deliveries WHERE dedupe_key = ?1"
                ),
                [dedupe_key],
                delivery_from_row,
            )
            .optional()?;
        Ok(delivery)
    }

    pub fn delivery_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM escalation_deliveries", [], |row| {
                row.get(0)
            })?)
    }

    /// Pending or failed deliveries with attempts left, oldest first.
    pub fn pending_deliveries(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<DeliveryCandidate>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT d.delivery_id, d.event_id, d.dedupe_key, d.status, d.attempt_count,
                   d.last_attempt_at, d.last_error, d.sent_at, d.created_at, e.payload_json
            FROM escalation_deliveries d
            LEFT JOIN operational_events e ON e.event_id = d.event_id
            WHERE d.status IN ('pending', 'failed')
              AND d.attempt_count < ?1
            ORDER BY d.created_at ASC, d.seq ASC
            LIMIT ?2
            ",
        )?;

        let rows = stmt.query_map(
            params![i64::from(max_attempts), limit.min(i64::MAX as usize) as i64],
            |row| {
                Ok(DeliveryCandidate {
                    delivery: delivery_from_row(row)?,
                    payload_json: row.get(9)?,
                })
            },
        )?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }

    /// Stamps the start of an attempt. Returns the new attempt count, or `None`
    /// if the row is gone or already terminal.
    pub fn begin_attempt(
        &self,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "
            UPDATE escalation_deliveries
            SET attempt_count = attempt_count + 1,
                last_attempt_at = ?2
            WHERE delivery_id = ?1
              AND status IN ('pending', 'failed')
            ",
            params![delivery_id, format_timestamp(now)],
        )?;
        if changes == 0 {
            return Ok(None);
        }

        let attempt_count = conn.query_row(
            "SELECT attempt_count FROM escalation_deliveries WHERE delivery_id = ?1",
            [delivery_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(Some(attempt_count.clamp(0, i64::from(u32::MAX)) as u32))
    }

    /// `sent_at` is only written the first time a row is delivered.
    pub fn mark_delivered(
        &self,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn()?.execute(
            "
            UPDATE escalation_deliveries
            SET status = 'delivered',
                sent_at = COALESCE(sent_at, ?2),
                last_error = NULL
            WHERE delivery_id = ?1
              AND status IN ('pending', 'failed')
            ",
            params![delivery_id, format_timestamp(now)],
        )?;
        Ok(changes > 0)
    }

    pub fn mark_failed(&self, delivery_id: &str, error: &str) -> Result<bool, StorageError> {
        let changes = self.conn()?.execute(
            "
            UPDATE escalation_deliveries
            SET status = 'failed',
                last_error = ?2
            WHERE delivery_id = ?1
              AND status IN ('pending', 'failed')
            ",
            params![delivery_id, error],
        )?;
        Ok(changes > 0)
    }

    pub fn cancel_delivery(&self, delivery_id: &str) -> Result<CancelOutcome, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                "SELECT status FROM escalation_deliveries WHERE delivery_id = ?1",
                [delivery_id],
                |row| status_column(row, 0),
            )
            .optional()?;

        let outcome = match current {
            None => CancelOutcome::NotFound,
            Some(status) if status.is_terminal() => CancelOutcome::AlreadyTerminal(status),
            Some(_) => {
                tx.execute(
                    "UPDATE escalation_deliveries SET status = 'canceled' WHERE delivery_id = ?1",
                    [delivery_id],
                )?;
                let delivery = tx.query_row(
                    &format!(
                        "SELECT {DELIVERY_COLUMNS} FROM escalation_deliveries WHERE delivery_id = ?1"
                    ),
                    [delivery_id],
                    delivery_from_row,
                )?;
                CancelOutcome::Canceled(delivery)
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Most recently created deliveries first.
    pub fn recent_deliveries(
        &self,
        status: Option<DeliveryStatus>,
        limit: usize,
    ) -> Result<Vec<EscalationDelivery>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {DELIVERY_COLUMNS}
            FROM escalation_deliveries
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2
            "
        ))?;

        let rows = stmt.query_map(
            params![
                status.map(|status| status.as_str()),
                limit.min(i64::MAX as usize) as i64
            ],
            delivery_from_row,
        )?;

        let mut deliveries = Vec::new();
        for row in rows {
            deliveries.push(row?);
        }
        Ok(deliveries)
    }

    pub fn delivery_backlog(&self) -> Result<DeliveryBacklog, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM escalation_deliveries GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((status_column(row, 0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?;

        let mut backlog = DeliveryBacklog::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                DeliveryStatus::Pending => backlog.pending = count,
                DeliveryStatus::Failed => backlog.failed = count,
                DeliveryStatus::Delivered => backlog.delivered = count,
                DeliveryStatus::Canceled => backlog.canceled = count,
            }
        }
        Ok(backlog)
    }

    pub fn insert_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<(), StorageError> {
        let counters = &snapshot.counters;
        self.conn()?.execute(
            "
            INSERT INTO escalation_metrics_snapshots (
                created_at,
                attempted,
                delivered,
                failed,
                skipped_breaker,
                skipped_backoff,
                skipped_none_pending,
                breaker_state,
                breaker_failure_count,
                breaker_opened_at,
                breaker_open_until,
                breaker_remaining_ms,
                source
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
            params![
                format_timestamp(snapshot.created_at),
                counters.attempted as i64,
                counters.delivered as i64,
                counters.failed as i64,
                counters.skipped_breaker as i64,
                counters.skipped_backoff as i64,
                counters.skipped_none_pending as i64,
                snapshot.breaker_state.as_str(),
                i64::from(snapshot.breaker_failure_count),
                snapshot.breaker_opened_at.map(format_timestamp),
                snapshot.breaker_open_until.map(format_timestamp),
                snapshot.breaker_remaining_ms as i64,
                snapshot.source,
            ],
        )?;
        Ok(())
    }

    pub fn metrics_snapshot_count(&self) -> Result<i64, StorageError> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*) FROM escalation_metrics_snapshots",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn latest_metrics_snapshot(&self) -> Result<Option<MetricsSnapshot>, StorageError> {
        let snapshot = self
            .conn()?
            .query_row(
                "
                SELECT created_at, attempted, delivered, failed, skipped_breaker, skipped_backoff,
                       skipped_none_pending, breaker_state, breaker_failure_count,
                       breaker_opened_at, breaker_open_until, breaker_remaining_ms, source
                FROM escalation_metrics_snapshots
                ORDER BY seq DESC
                LIMIT 1
                ",
                [],
                |row| {
                    let breaker_state: String = row.get(7)?;
                    Ok(MetricsSnapshot {
                        created_at: timestamp_column(row, 0)?,
                        counters: counters_from_row(row, 1)?,
                        breaker_state: breaker_state.parse().unwrap_or_default(),
                        breaker_failure_count: row.get::<_, i64>(8)?.clamp(0, i64::from(u32::MAX))
                            as u32,
                        breaker_opened_at: optional_timestamp_column(row, 9)?,
                        breaker_open_until: optional_timestamp_column(row, 10)?,
                        breaker_remaining_ms: row.get::<_, i64>(11)?.max(0) as u64,
                        source: row.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Folds raw snapshots older than the retention cutoff into hourly rollups,
    /// refreshes the daily rollups of the touched days from the hourly rows,
    /// and deletes the folded snapshots, all in one transaction.
    ///
    /// The cutoff is aligned down to the hour, so an hourly bucket is always
    /// folded in a single run. Because the consumed snapshots are deleted in the
    /// same transaction that merges them, re-running over the same data finds
    /// nothing left and leaves every rollup unchanged.
    pub fn compact_metrics(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> Result<CompactionReport, StorageError> {
        let retention_start = Duration::try_days(i64::from(retention_days))
            .and_then(|retention| now.checked_sub_signed(retention))
            .ok_or(StorageError::RetentionOutOfRange(retention_days))?;
        let cutoff = RollupGranularity::Hourly.bucket_start(retention_start);
        let cutoff_text = format_timestamp(cutoff);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut hourly: BTreeMap<DateTime<Utc>, BucketTotals> = BTreeMap::new();
        let mut max_seq: Option<i64> = None;
        let mut snapshots_compacted = 0usize;
        {
            let mut stmt = tx.prepare(
                "
                SELECT seq, created_at, attempted, delivered, failed, skipped_breaker,
                       skipped_backoff, skipped_none_pending, breaker_state
                FROM escalation_metrics_snapshots
                WHERE created_at < ?1
                ORDER BY seq ASC
                ",
            )?;
            let rows = stmt.query_map([&cutoff_text], |row| {
                let seq: i64 = row.get(0)?;
                let created_at = timestamp_column(row, 1)?;
                let counters = counters_from_row(row, 2)?;
                let breaker_state: String = row.get(8)?;
                Ok((seq, created_at, counters, breaker_state))
            })?;

            for row in rows {
                let (seq, created_at, counters, breaker_state) = row?;
                let totals = hourly
                    .entry(RollupGranularity::Hourly.bucket_start(created_at))
                    .or_default();
                totals.counters.accumulate(&counters);
                totals.samples += 1;
                if breaker_state == BreakerState::Open.as_str() {
                    totals.breaker_open_count += 1;
                }
                max_seq = Some(max_seq.map_or(seq, |current| current.max(seq)));
                snapshots_compacted += 1;
            }
        }

        let Some(max_seq) = max_seq else {
            tx.commit()?;
            return Ok(CompactionReport {
                cutoff: Some(cutoff),
                ..CompactionReport::default()
            });
        };

        let updated_at = format_timestamp(now);
        let mut touched_days = BTreeSet::new();
        for (bucket_start, totals) in &hourly {
            let counters = &totals.counters;
            tx.execute(
                &format!(
                    "
                    INSERT INTO escalation_metrics_rollup_hourly ({ROLLUP_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(bucket_start) DO UPDATE SET
                        attempted = attempted + excluded.attempted,
                        delivered = delivered + excluded.delivered,
                        failed = failed + excluded.failed,
                        skipped_breaker = skipped_breaker + excluded.skipped_breaker,
                        skipped_backoff = skipped_backoff + excluded.skipped_backoff,
                        skipped_none_pending = skipped_none_pending + excluded.skipped_none_pending,
                        breaker_open_count = breaker_open_count + excluded.breaker_open_count,
                        sample_count = sample_count + excluded.sample_count,
                        updated_at = excluded.updated_at
                    "
                ),
                params![
                    format_timestamp(*bucket_start),
                    counters.attempted as i64,
                    counters.delivered as i64,
                    counters.failed as i64,
                    counters.skipped_breaker as i64,
                    counters.skipped_backoff as i64,
                    counters.skipped_none_pending as i64,
                    totals.breaker_open_count as i64,
                    totals.samples as i64,
                    updated_at,
                ],
            )?;
            touched_days.insert(RollupGranularity::Daily.bucket_start(*bucket_start));
        }

        for day_start in &touched_days {
            let day_end = *day_start + Duration::days(1);
            tx.execute(
                &format!(
                    "
                    INSERT INTO escalation_metrics_rollup_daily ({ROLLUP_COLUMNS})
                    SELECT ?1,
                           COALESCE(SUM(attempted), 0),
                           COALESCE(SUM(delivered), 0),
                           COALESCE(SUM(failed), 0),
                           COALESCE(SUM(skipped_breaker), 0),
                           COALESCE(SUM(skipped_backoff), 0),
                           COALESCE(SUM(skipped_none_pending), 0),
                           COALESCE(SUM(breaker_open_count), 0),
                           COALESCE(SUM(sample_count), 0),
                           ?4
                    FROM escalation_metrics_rollup_hourly
                    WHERE bucket_start >= ?2 AND bucket_start < ?3
                    ON CONFLICT(bucket_start) DO UPDATE SET
                        attempted = excluded.attempted,
                        delivered = excluded.delivered,
                        failed = excluded.failed,
                        skipped_breaker = excluded.skipped_breaker,
                        skipped_backoff = excluded.skipped_backoff,
                        skipped_none_pending = excluded.skipped_none_pending,
                        breaker_open_count = excluded.breaker_open_count,
                        sample_count = excluded.sample_count,
                        updated_at = excluded.updated_at
                    "
                ),
                params![
                    format_timestamp(*day_start),
                    format_timestamp(*day_start),
                    format_timestamp(day_end),
                    updated_at,
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM escalation_metrics_snapshots WHERE created_at < ?1 AND seq <= ?2",
            params![cutoff_text, max_seq],
        )?;
        tx.commit()?;

        Ok(CompactionReport {
            cutoff: Some(cutoff),
            snapshots_compacted,
            hourly_buckets: hourly.len(),
            daily_buckets: touched_days.len(),
        })
    }

    /// Newest buckets first.
    pub fn rollups(
        &self,
        granularity: RollupGranularity,
        limit: usize,
    ) -> Result<Vec<MetricsRollup>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROLLUP_COLUMNS} FROM {} ORDER BY bucket_start DESC LIMIT ?1",
            rollup_table(granularity)
        ))?;
        let rows = stmt.query_map([limit.min(i64::MAX as usize) as i64], |row| {
            rollup_from_row(row, granularity)
        })?;

        let mut rollups = Vec::new();
        for row in rows {
            rollups.push(row?);
        }
        Ok(rollups)
    }

    pub fn rollup(
        &self,
        granularity: RollupGranularity,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<MetricsRollup>, StorageError> {
        let rollup = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {ROLLUP_COLUMNS} FROM {} WHERE bucket_start = ?1",
                    rollup_table(granularity)
                ),
                [format_timestamp(granularity.bucket_start(bucket_start))],
                |row| rollup_from_row(row, granularity),
            )
            .optional()?;
        Ok(rollup)
    }
}

#[derive(Debug, Default)]
struct BucketTotals {
    counters: DeliveryCounters,
    breaker_open_count: u64,
    samples: u64,
}

fn rollup_table(granularity: RollupGranularity) -> &'static str {
    match granularity {
        RollupGranularity::Hourly => "escalation_metrics_rollup_hourly",
        RollupGranularity::Daily => "escalation_metrics_rollup_daily",
    }
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<EscalationDelivery> {
    Ok(EscalationDelivery {
        id: row.get(0)?,
        event_id: row.get(1)?,
        dedupe_key: row.get(2)?,
        status: status_column(row, 3)?,
        attempt_count: row.get::<_, i64>(4)?.clamp(0, i64::from(u32::MAX)) as u32,
        last_attempt_at: optional_timestamp_column(row, 5)?,
        last_error: row.get(6)?,
        sent_at: optional_timestamp_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

fn rollup_from_row(
    row: &Row<'_>,
    granularity: RollupGranularity,
) -> rusqlite::Result<MetricsRollup> {
    Ok(MetricsRollup {
        granularity,
        bucket_start: timestamp_column(row, 0)?,
        counters: counters_from_row(row, 1)?,
        breaker_open_count: row.get::<_, i64>(7)?.max(0) as u64,
        sample_count: row.get::<_, i64>(8)?.max(0) as u64,
        updated_at: timestamp_column(row, 9)?,
    })
}

/// Reads six consecutive counter columns starting at `first`.
fn counters_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<DeliveryCounters> {
    let column = |offset: usize| -> rusqlite::Result<u64> {
        Ok(row.get::<_, i64>(first + offset)?.max(0) as u64)
    };
    Ok(DeliveryCounters {
        attempted: column(0)?,
        delivered: column(1)?,
        failed: column(2)?,
        skipped_breaker: column(3)?,
        skipped_backoff: column(4)?,
        skipped_none_pending: column(5)?,
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DeliveryStatus> {
    let value: String = row.get(idx)?;
    value
        .parse::<DeliveryStatus>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(value) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    parse_timestamp(&value)
        .map(Some)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Fixed-width UTC form so lexical order in SQL matches chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
