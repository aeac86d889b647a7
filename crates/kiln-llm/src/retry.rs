use serde::{Deserialize, Serialize};

/// Backoff policy for retryable model failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Delay before retrying after `attempt` failed attempts (1-based).
pub fn delay_for_attempt_ms(attempt: u32, policy: &RetryPolicy, jitter_seed: u64) -> u64 {
    let exp = attempt.saturating_sub(1) as i32;
    let base = (policy.initial_delay_ms as f64) * policy.backoff_factor.powi(exp);
    let mut delay = base.min(policy.max_delay_ms as f64);
    if policy.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

// xorshift; yields a factor in [0.5, 1.5]
fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E37_79B9_7F4A_7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}
