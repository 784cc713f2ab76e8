use crate::add_millis;
use chrono::{DateTime, Utc};
use rand::Rng;

/// Exponential retry delay with additive jitter.
///
/// `delay(n) = min(base * 2^n, max) + uniform(0..=jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 5_000,
            max_ms: 300_000,
            jitter_ms: 1_000,
        }
    }
}

impl BackoffPolicy {
    pub fn normalized(mut self) -> Self {
        self.max_ms = self.max_ms.max(self.base_ms);
        self
    }

    /// Delay before jitter. Non-decreasing in `attempt_count`.
    pub fn base_backoff_ms(&self, attempt_count: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    pub fn compute_backoff_ms(&self, attempt_count: u32) -> u64 {
        self.compute_backoff_ms_with(attempt_count, &mut rand::thread_rng())
    }

    pub fn compute_backoff_ms_with<R>(&self, attempt_count: u32, rng: &mut R) -> u64
    where
        R: Rng + ?Sized,
    {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=self.jitter_ms)
        };
        self.base_backoff_ms(attempt_count).saturating_add(jitter)
    }

    /// A delivery that was never attempted is always eligible.
    pub fn is_eligible(
        &self,
        last_attempt_at: Option<DateTime<Utc>>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_attempt_at) = last_attempt_at else {
            return true;
        };
        match add_millis(last_attempt_at, self.compute_backoff_ms(attempt_count)) {
            Some(eligible_at) => now >= eligible_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn deterministic(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_ms,
            max_ms,
            jitter_ms: 0,
        }
    }

    #[test]
    fn doubles_per_attempt_until_capped() {
        let policy = deterministic(5_000, 60_000);
        let delays = (0..6)
            .map(|attempt| policy.compute_backoff_ms(attempt))
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000, 60_000, 60_000]);
    }

    #[test]
    fn base_delay_is_monotonic_and_never_overflows() {
        let policy = BackoffPolicy::default();
        let mut previous = 0;
        for attempt in 0..200 {
            let delay = policy.base_backoff_ms(attempt);
            assert!(delay >= previous, "attempt {attempt} decreased");
            assert!(delay <= policy.max_ms);
            previous = delay;
        }
        assert_eq!(policy.base_backoff_ms(u32::MAX), policy.max_ms);
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        let policy = BackoffPolicy {
            base_ms: 1_000,
            max_ms: 1_000,
            jitter_ms: 250,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let delay = policy.compute_backoff_ms_with(3, &mut rng);
            assert!((1_000..=1_250).contains(&delay));
        }
    }

    #[test]
    fn eligibility_waits_for_the_backoff_window() {
        let policy = deterministic(5_000, 300_000);
        let last = ts(0);

        assert!(policy.is_eligible(None, 0, last));
        assert!(!policy.is_eligible(Some(last), 1, ts(5_000)));
        assert!(policy.is_eligible(Some(last), 1, ts(10_000)));
        assert!(policy.is_eligible(Some(last), 1, ts(11_000)));
    }

    #[test]
    fn normalized_raises_max_to_base() {
        let policy = deterministic(9_000, 10).normalized();
        assert_eq!(policy.max_ms, 9_000);
        assert_eq!(policy.compute_backoff_ms(4), 9_000);
    }
}
