use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_millis(250);
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Delay before reconnect attempt `attempt` (1-based): doubling from
/// [`BASE_DELAY`], capped at [`MAX_DELAY`], with ±10% jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = BASE_DELAY.as_millis() as u64;
    let max_ms = MAX_DELAY.as_millis() as u64;
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
    let delay_ms = base_ms.saturating_mul(pow).min(max_ms);

    let jitter_window = (delay_ms / 10).max(1);
    let offset = rand::rng().random_range(0..=jitter_window * 2);
    let final_ms = delay_ms
        .saturating_sub(jitter_window)
        .saturating_add(offset)
        .min(max_ms);
    Duration::from_millis(final_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_short() {
        let d = reconnect_delay(1);
        assert!(d >= Duration::from_millis(225) && d <= Duration::from_millis(275), "{:?}", d);
    }

    #[test]
    fn test_delay_is_capped() {
        for attempt in 1..200 {
            assert!(reconnect_delay(attempt) <= MAX_DELAY);
        }
        assert!(reconnect_delay(50) >= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_grows() {
        assert!(reconnect_delay(4) > reconnect_delay(1));
    }
}
