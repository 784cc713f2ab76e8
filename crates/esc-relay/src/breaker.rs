//! Webhook circuit breaker.
//!
//! `Closed` lets every attempt through and counts consecutive failures. Once
//! the threshold is hit the breaker opens and denies attempts for `open_ms`.
//! The first evaluation after that window moves it to `HalfOpen`, where a
//! single probe is admitted: success closes the breaker, failure reopens it
//! with a fresh window.
//!
//! State is process-local and owned by the delivery worker.

use crate::add_millis;
use chrono::{DateTime, Utc};
use esc_core::{BreakerSnapshot, BreakerState};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_ms: u64,
    /// `0` disables half-open probing; the breaker then stays shut until reset.
    pub half_open_max_probes: u32,
    /// Minimum spacing between denial log lines.
    pub log_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_ms: 60_000,
            half_open_max_probes: 1,
            log_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the half-open probe. The caller must report an outcome or
    /// call [`CircuitBreaker::abandon_probe`].
    Probe,
    Denied,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    last_denial_log_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: config.normalized(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            last_denial_log_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn can_attempt(&mut self, now: DateTime<Utc>) -> Admission {
        if self.state == BreakerState::Open {
            if now < self.open_until().unwrap_or(now) {
                self.log_denial(now, "open");
                return Admission::Denied;
            }
            self.state = BreakerState::HalfOpen;
            self.probe_in_flight = false;
            info!(event = "breaker_half_open");
        }

        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => {
                if self.config.half_open_max_probes == 0 || self.probe_in_flight {
                    self.log_denial(now, "half_open");
                    return Admission::Denied;
                }
                self.probe_in_flight = true;
                Admission::Probe
            }
            BreakerState::Open => Admission::Denied,
        }
    }

    pub fn on_success(&mut self, _now: DateTime<Utc>) {
        if self.state != BreakerState::Closed {
            info!(event = "breaker_closed", previous_state = %self.state);
        }
        self.close();
    }

    pub fn on_failure(&mut self, now: DateTime<Utc>) {
        match self.state {
            BreakerState::HalfOpen => {
                warn!(event = "breaker_reopened");
                self.open(now);
            }
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        event = "breaker_opened",
                        failures = self.consecutive_failures,
                        open_ms = self.config.open_ms
                    );
                    self.open(now);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Operator override: closes the breaker regardless of cooldown.
    pub fn reset(&mut self) {
        info!(event = "breaker_reset", previous_state = %self.state);
        self.close();
        self.last_denial_log_at = None;
    }

    /// Frees a granted probe slot without recording an outcome.
    pub fn abandon_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let open_until = self.open_until();
        let remaining_ms = match (self.state, open_until) {
            (BreakerState::Open, Some(until)) if until > now => {
                (until - now).num_milliseconds().max(0) as u64
            }
            _ => 0,
        };
        BreakerSnapshot {
            state: self.state,
            failure_count: self.consecutive_failures,
            opened_at: self.opened_at,
            open_until,
            remaining_ms,
            probe_in_flight: self.probe_in_flight,
        }
    }

    fn open_until(&self) -> Option<DateTime<Utc>> {
        self.opened_at
            .and_then(|opened_at| add_millis(opened_at, self.config.open_ms))
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    fn log_denial(&mut self, now: DateTime<Utc>, reason: &'static str) {
        let due = match self.last_denial_log_at {
            None => true,
            Some(last) => add_millis(last, self.config.log_ms).map_or(false, |next| now >= next),
        };
        if due {
            self.last_denial_log_at = Some(now);
            warn!(
                event = "breaker_denied",
                reason,
                remaining_ms = self.snapshot(now).remaining_ms
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            open_ms,
            half_open_max_probes: 1,
            log_ms: 1_000,
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = breaker(3, 60_000);
        breaker.on_failure(ts(0));
        breaker.on_failure(ts(1));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.on_failure(ts(2));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.can_attempt(ts(3)), Admission::Denied);

        let snapshot = breaker.snapshot(ts(2));
        assert_eq!(snapshot.opened_at, Some(ts(2)));
        assert_eq!(snapshot.open_until, Some(ts(60_002)));
        assert_eq!(snapshot.remaining_ms, 60_000);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut breaker = breaker(2, 60_000);
        breaker.on_failure(ts(0));
        breaker.on_success(ts(1));
        breaker.on_failure(ts(2));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let mut breaker = breaker(1, 10_000);
        breaker.on_failure(ts(0));

        assert_eq!(breaker.can_attempt(ts(9_999)), Admission::Denied);
        assert_eq!(breaker.can_attempt(ts(10_000)), Admission::Probe);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.can_attempt(ts(10_001)), Admission::Denied);
        assert!(breaker.snapshot(ts(10_001)).probe_in_flight);

        breaker.on_success(ts(10_002));
        let snapshot = breaker.snapshot(ts(10_002));
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.opened_at, None);
        assert!(!snapshot.probe_in_flight);
    }

    #[test]
    fn failed_probe_reopens_with_fresh_window() {
        let mut breaker = breaker(1, 10_000);
        breaker.on_failure(ts(0));
        assert_eq!(breaker.can_attempt(ts(10_000)), Admission::Probe);

        breaker.on_failure(ts(10_500));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot(ts(10_500)).opened_at, Some(ts(10_500)));
        assert_eq!(breaker.can_attempt(ts(20_000)), Admission::Denied);
        assert_eq!(breaker.can_attempt(ts(20_500)), Admission::Probe);
    }

    #[test]
    fn zero_probes_keeps_half_open_shut() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_ms: 1_000,
            half_open_max_probes: 0,
            log_ms: 1_000,
        });
        breaker.on_failure(ts(0));
        assert_eq!(breaker.can_attempt(ts(5_000)), Admission::Denied);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let mut breaker = breaker(1, 1_000);
        breaker.on_failure(ts(0));
        assert_eq!(breaker.can_attempt(ts(1_000)), Admission::Probe);
        breaker.abandon_probe();
        assert_eq!(breaker.can_attempt(ts(1_001)), Admission::Probe);
    }

    #[test]
    fn reset_bypasses_cooldown() {
        let mut breaker = breaker(1, 600_000);
        breaker.on_failure(ts(0));
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.can_attempt(ts(1)), Admission::Allowed);
        assert_eq!(breaker.snapshot(ts(1)).remaining_ms, 0);
    }
}
