//! Retry delay computation
//!
//! `delay(n) = min(base * 2^(n-1) * (1 ± jitter), max)` where `n` is the number
//! of failed attempts so far. Until the cap is reached the jitter band of
//! attempt `n` starts above the band of attempt `n - 1`, so delays grow
//! strictly whatever the random draws.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Un-jittered delay after `attempt` failures (`attempt >= 1`), capped
pub fn nominal_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let ms = policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms);
    Duration::from_millis(ms)
}

/// Jittered delay after `attempt` failures, never above the cap and never zero
pub fn retry_delay<R: Rng + ?Sized>(policy: &RetryPolicy, attempt: u32, rng: &mut R) -> Duration {
    let (low, high) = delay_bounds(policy, attempt);
    let ms = if low < high { rng.gen_range(low..=high) } else { high };
    Duration::from_millis(ms)
}

/// Inclusive range `retry_delay` draws from, in milliseconds
pub fn delay_bounds(policy: &RetryPolicy, attempt: u32) -> (u64, u64) {
    let (low, high) = jitter_band(policy, attempt);
    let previous_nominal = nominal_delay(policy, attempt.saturating_sub(1)).as_millis() as u64;
    if attempt <= 1 || previous_nominal >= policy.max_delay_ms {
        return (low, high);
    }

    // The step onto the cap can be small (256s -> 300s), stay above the previous band
    let (_, previous_high) = jitter_band(policy, attempt - 1);
    (low.max(previous_high.saturating_add(1)).min(high), high)
}

fn jitter_band(policy: &RetryPolicy, attempt: u32) -> (u64, u64) {
    let nominal = nominal_delay(policy, attempt).as_millis() as u64;
    let spread = (nominal as f64 * policy.jitter_ratio) as u64;
    let high = nominal.saturating_add(spread).clamp(1, policy.max_delay_ms.max(1));
    let low = nominal.saturating_sub(spread).clamp(1, high);
    (low, high)
}

/// Absolute time (ms) of the next attempt
pub fn next_retry_at(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(delay.as_millis().max(1) as i64)
}
