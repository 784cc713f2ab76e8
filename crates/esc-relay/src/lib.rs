pub mod backoff;
pub mod breaker;
pub mod dispatch;
pub mod intake;
pub mod metrics;
pub mod runtime;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use breaker::{Admission, BreakerConfig, CircuitBreaker};
pub use dispatch::{DispatchOutcome, Dispatcher, WebhookDispatcher};
pub use intake::{EscalationIntake, EventBus, IntakeOutcome, Subscription};
pub use metrics::SnapshotCadence;
pub use runtime::{spawn_relay_runtime, RelayRuntimeHandle};
pub use worker::{DeliveryWorker, PassReport};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Offsets are capped so timestamp arithmetic cannot leave chrono's range.
const MAX_OFFSET_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("storage error: {0}")]
    Storage(#[from] esc_storage::StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] esc_core::ContractError),
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub breaker: BreakerConfig,
    pub snapshot_interval_ms: u64,
    pub retention_days: u32,
    pub poll_interval_ms: u64,
    pub compaction_interval_ms: u64,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub environment: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 8,
            batch_size: 25,
            breaker: BreakerConfig::default(),
            snapshot_interval_ms: 60_000,
            retention_days: 14,
            poll_interval_ms: 5_000,
            compaction_interval_ms: 3_600_000,
            webhook_url: None,
            webhook_timeout_ms: 10_000,
            shutdown_grace_ms: 15_000,
            environment: "development".to_string(),
        }
    }
}

impl RelayConfig {
    /// Clamps values that would make the pipeline stall or spin.
    pub fn normalized(mut self) -> Self {
        self.backoff = self.backoff.normalized();
        self.breaker = self.breaker.normalized();
        self.max_attempts = self.max_attempts.max(1);
        self.batch_size = self.batch_size.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.compaction_interval_ms = self.compaction_interval_ms.max(1);
        self.webhook_timeout_ms = self.webhook_timeout_ms.max(1);
        self.webhook_url = self
            .webhook_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if self.environment.trim().is_empty() {
            self.environment = "development".to_string();
        }
        self
    }
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_OFFSET_MS) as i64)
}

/// `None` when the result would overflow.
pub(crate) fn add_millis(ts: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    ts.checked_add_signed(millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_repairs_inconsistent_settings() {
        let config = RelayConfig {
            backoff: BackoffPolicy {
                base_ms: 10_000,
                max_ms: 100,
                jitter_ms: 0,
            },
            max_attempts: 0,
            batch_size: 0,
            breaker: BreakerConfig {
                failure_threshold: 0,
                ..BreakerConfig::default()
            },
            webhook_url: Some("   ".to_string()),
            environment: String::new(),
            ..RelayConfig::default()
        }
        .normalized();

        assert_eq!(config.backoff.max_ms, 10_000);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.breaker.failure_threshold, 1);
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.environment, "development");
    }
}
