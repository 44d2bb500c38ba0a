//! Unit tests for task retry backoff

use std::time::Duration;

use escalade::queue::TaskQueue;
use proptest::prelude::*;

const BASE: Duration = Duration::from_secs(60);
const MAX: Duration = Duration::from_secs(3600);

#[test]
fn test_first_attempt_starts_at_base() {
    let delay = TaskQueue::backoff_delay(1, BASE, MAX);
    assert!(delay >= BASE);
    assert!(delay <= BASE.mul_f64(1.1));
}

#[test]
fn test_delay_doubles_per_attempt() {
    let delay = TaskQueue::backoff_delay(3, BASE, MAX);
    // 60 * 2^2 = 240s, plus up to 10% jitter
    assert!(delay >= Duration::from_secs(240));
    assert!(delay <= Duration::from_secs(240).mul_f64(1.1));
}

#[test]
fn test_delay_caps_at_max() {
    let delay = TaskQueue::backoff_delay(30, BASE, MAX);
    assert!(delay >= MAX);
    assert!(delay <= MAX.mul_f64(1.1));
}

#[test]
fn test_zero_attempts_treated_as_first() {
    let delay = TaskQueue::backoff_delay(0, BASE, MAX);
    assert!(delay >= BASE);
    assert!(delay <= BASE.mul_f64(1.1));
}

proptest! {
    #[test]
    fn prop_delay_always_within_bounds(attempts in 1i32..64) {
        let delay = TaskQueue::backoff_delay(attempts, BASE, MAX);
        let expected = BASE
            .checked_mul(2u32.saturating_pow(attempts as u32 - 1))
            .unwrap_or(MAX)
            .min(MAX);
        prop_assert!(delay >= expected);
        prop_assert!(delay <= expected.mul_f64(1.1));
    }
}
