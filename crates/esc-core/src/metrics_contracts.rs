use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" | "half-open" | "halfopen" => Ok(BreakerState::HalfOpen),
            other => Err(format!("unknown breaker state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub remaining_ms: u64,
    pub probe_in_flight: bool,
}

/// Cumulative since process start; reset on restart.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryCounters {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub skipped_breaker: u64,
    pub skipped_backoff: u64,
    pub skipped_none_pending: u64,
}

impl DeliveryCounters {
    pub fn accumulate(&mut self, other: &DeliveryCounters) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.skipped_breaker += other.skipped_breaker;
        self.skipped_backoff += other.skipped_backoff;
        self.skipped_none_pending += other.skipped_none_pending;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub created_at: DateTime<Utc>,
    pub counters: DeliveryCounters,
    pub breaker_state: BreakerState,
    pub breaker_failure_count: u32,
    pub breaker_opened_at: Option<DateTime<Utc>>,
    pub breaker_open_until: Option<DateTime<Utc>>,
    pub breaker_remaining_ms: u64,
    pub source: String,
}

impl MetricsSnapshot {
    pub fn capture(
        now: DateTime<Utc>,
        counters: DeliveryCounters,
        breaker: &BreakerSnapshot,
        source: impl Into<String>,
    ) -> Self {
        Self {
            created_at: now,
            counters,
            breaker_state: breaker.state,
            breaker_failure_count: breaker.failure_count,
            breaker_opened_at: breaker.opened_at,
            breaker_open_until: breaker.open_until,
            breaker_remaining_ms: breaker.remaining_ms,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RollupGranularity {
    Hourly,
    Daily,
}

impl RollupGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupGranularity::Hourly => "hourly",
            RollupGranularity::Daily => "daily",
        }
    }

    pub fn bucket_seconds(&self) -> i64 {
        match self {
            RollupGranularity::Hourly => SECONDS_PER_HOUR,
            RollupGranularity::Daily => SECONDS_PER_DAY,
        }
    }

    /// Start of the UTC bucket containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = ts.timestamp();
        let start = seconds - seconds.rem_euclid(self.bucket_seconds());
        DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(ts)
    }
}

impl fmt::Display for RollupGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollupGranularity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "hourly" | "hour" => Ok(RollupGranularity::Hourly),
            "daily" | "day" => Ok(RollupGranularity::Daily),
            other => Err(format!("unknown rollup granularity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsRollup {
    pub granularity: RollupGranularity,
    pub bucket_start: DateTime<Utc>,
    pub counters: DeliveryCounters,
    pub breaker_open_count: u64,
    pub sample_count: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub snapshots_compacted: usize,
    pub hourly_buckets: usize,
    pub daily_buckets: usize,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.snapshots_compacted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_start_truncates_to_hour_and_day() {
        let ts = Utc
            .with_ymd_and_hms(2026, 3, 14, 15, 42, 7)
            .single()
            .expect("valid ts");

        assert_eq!(
            RollupGranularity::Hourly.bucket_start(ts),
            Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0)
                .single()
                .expect("hour")
        );
        assert_eq!(
            RollupGranularity::Daily.bucket_start(ts),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0)
                .single()
                .expect("day")
        );
    }

    #[test]
    fn breaker_state_round_trips_through_str() {
        for state in [
            BreakerState::Closed,
            BreakerState::Open,
            BreakerState::HalfOpen,
        ] {
            assert_eq!(state.as_str().parse::<BreakerState>(), Ok(state));
        }
    }

    #[test]
    fn counters_accumulate_field_by_field() {
        let mut total = DeliveryCounters {
            attempted: 2,
            delivered: 1,
            failed: 1,
            ..DeliveryCounters::default()
        };
        total.accumulate(&DeliveryCounters {
            attempted: 3,
            delivered: 3,
            skipped_backoff: 4,
            ..DeliveryCounters::default()
        });

        assert_eq!(total.attempted, 5);
        assert_eq!(total.delivered, 4);
        assert_eq!(total.failed, 1);
        assert_eq!(total.skipped_backoff, 4);
    }
}
