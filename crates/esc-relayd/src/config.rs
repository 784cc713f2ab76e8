use clap::Parser;
use esc_relay::{BackoffPolicy, BreakerConfig, RelayConfig};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "esc-relayd", about = "Escalation webhook relay")]
pub struct Args {
    #[arg(long, env = "ESCALATION_DB_PATH", default_value = ".escalation/relay.db")]
    pub db_path: PathBuf,
    #[arg(long, env = "ESCALATION_ADMIN_ADDR", default_value = "127.0.0.1:8787")]
    pub admin_addr: String,
    #[arg(long, env = "ESCALATION_WEBHOOK_URL", hide_env_values = true)]
    pub webhook_url: Option<String>,
    #[arg(long, env = "ESCALATION_WEBHOOK_TIMEOUT_MS", default_value_t = 10_000)]
    pub webhook_timeout_ms: u64,
    #[arg(long, env = "ESCALATION_ENVIRONMENT", default_value = "development")]
    pub environment: String,

    #[arg(long, env = "ESCALATION_RETRY_BASE_MS", default_value_t = 5_000)]
    pub retry_base_ms: u64,
    #[arg(long, env = "ESCALATION_RETRY_MAX_MS", default_value_t = 300_000)]
    pub retry_max_ms: u64,
    #[arg(long, env = "ESCALATION_RETRY_JITTER_MS", default_value_t = 1_000)]
    pub retry_jitter_ms: u64,
    #[arg(long, env = "ESCALATION_MAX_ATTEMPTS", default_value_t = 8)]
    pub max_attempts: u32,
    #[arg(long, env = "ESCALATION_BATCH_SIZE", default_value_t = 25)]
    pub batch_size: usize,

    #[arg(long, env = "ESCALATION_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub breaker_failure_threshold: u32,
    #[arg(long, env = "ESCALATION_BREAKER_OPEN_MS", default_value_t = 60_000)]
    pub breaker_open_ms: u64,
    #[arg(long, env = "ESCALATION_BREAKER_HALF_OPEN_MAX_PROBES", default_value_t = 1)]
    pub breaker_half_open_max_probes: u32,
    #[arg(long, env = "ESCALATION_BREAKER_LOG_MS", default_value_t = 30_000)]
    pub breaker_log_ms: u64,

    #[arg(long, env = "ESCALATION_METRICS_SNAPSHOT_MS", default_value_t = 60_000)]
    pub metrics_snapshot_ms: u64,
    #[arg(long, env = "ESCALATION_METRICS_RETENTION_DAYS", default_value_t = 14)]
    pub metrics_retention_days: u32,
    #[arg(long, env = "ESCALATION_POLL_MS", default_value_t = 5_000)]
    pub poll_ms: u64,
    #[arg(long, env = "ESCALATION_COMPACTION_MS", default_value_t = 3_600_000)]
    pub compaction_ms: u64,
    #[arg(long, env = "ESCALATION_SHUTDOWN_GRACE_MS", default_value_t = 15_000)]
    pub shutdown_grace_ms: u64,

    /// Used when `RUST_LOG` is unset.
    #[arg(long, env = "ESCALATION_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            backoff: BackoffPolicy {
                base_ms: self.retry_base_ms,
                max_ms: self.retry_max_ms,
                jitter_ms: self.retry_jitter_ms,
            },
            max_attempts: self.max_attempts,
            batch_size: self.batch_size,
            breaker: BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                open_ms: self.breaker_open_ms,
                half_open_max_probes: self.breaker_half_open_max_probes,
                log_ms: self.breaker_log_ms,
            },
            snapshot_interval_ms: self.metrics_snapshot_ms,
            retention_days: self.metrics_retention_days,
            poll_interval_ms: self.poll_ms,
            compaction_interval_ms: self.compaction_ms,
            webhook_url: self.webhook_url.clone(),
            webhook_timeout_ms: self.webhook_timeout_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            environment: self.environment.clone(),
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_relay_config() {
        let args = Args::try_parse_from([
            "esc-relayd",
            "--retry-base-ms",
            "2000",
            "--retry-max-ms",
            "10",
            "--batch-size",
            "0",
            "--breaker-failure-threshold",
            "2",
            "--webhook-url",
            "https://hooks.example.org/escalate",
            "--environment",
            "staging",
        ])
        .expect("parse args");
        let config = args.relay_config();

        assert_eq!(config.backoff.base_ms, 2_000);
        assert_eq!(config.backoff.max_ms, 2_000);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("https://hooks.example.org/escalate")
        );
        assert_eq!(config.environment, "staging");
    }
}
