use pacp_schemas::RetryPolicy;
use rand::Rng;

/// Shared backoff math for both scheduler shapes: `delay = base ×
/// multiplier^(retry_count − 1)`, capped at `ceiling_seconds`, with
/// optional `rand(0, delay/2)` jitter (spec §4.5, unifying the lane
/// scheduler's configured policy and the serial scheduler's
/// `10 × 2^(n−1)` special case — spec §9 open question).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_seconds: f64,
    pub multiplier: f64,
    pub jitter: bool,
    pub ceiling_seconds: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_seconds: 10.0, multiplier: 2.0, jitter: false, ceiling_seconds: 300.0 }
    }
}

impl BackoffPolicy {
    pub fn from_retry_policy(policy: &RetryPolicy) -> Self {
        Self {
            base_seconds: policy.backoff_base_seconds,
            multiplier: policy.backoff_multiplier,
            jitter: policy.backoff_jitter,
            ..Self::default()
        }
    }

    /// `retry_count` is the attempt number about to be scheduled (1 for
    /// the first retry), matching the spec's `retry_count − 1` exponent.
    pub fn delay(&self, retry_count: i32) -> chrono::Duration {
        let exponent = (retry_count - 1).max(0);
        let raw = self.base_seconds * self.multiplier.powi(exponent);
        let capped = raw.min(self.ceiling_seconds);

        let with_jitter = if self.jitter && capped > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..=(capped / 2.0))
        } else {
            capped
        };

        chrono::Duration::milliseconds((with_jitter * 1000.0).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_documented_retry_then_fail_schedule() {
        let backoff = BackoffPolicy { base_seconds: 10.0, multiplier: 2.0, jitter: false, ceiling_seconds: 300.0 };
        assert_eq!(backoff.delay(1).num_seconds(), 10);
        assert_eq!(backoff.delay(2).num_seconds(), 20);
        assert_eq!(backoff.delay(3).num_seconds(), 40);
    }

    #[test]
    fn caps_at_the_configured_ceiling() {
        let backoff = BackoffPolicy { base_seconds: 10.0, multiplier: 2.0, jitter: false, ceiling_seconds: 300.0 };
        assert_eq!(backoff.delay(10).num_seconds(), 300);
    }

    #[test]
    fn jitter_never_exceeds_one_and_a_half_times_the_base_delay() {
        let backoff = BackoffPolicy { base_seconds: 10.0, multiplier: 2.0, jitter: true, ceiling_seconds: 300.0 };
        for _ in 0..50 {
            let ms = backoff.delay(2).num_milliseconds();
            assert!(ms >= 20_000 && ms <= 30_000, "delay out of expected jitter range: {ms}ms");
        }
    }
}
