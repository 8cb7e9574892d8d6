use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectDelay;

const BASE_DELAY_MS: u64 = 1000;
const MAX_EXPONENT: u32 = 6;

/// Upper bound of the jitter window for a given retry count:
/// `1000ms * 2^min(retry, 6)`, so the worst case caps at 64 s.
pub fn delay_cap(retry: u32) -> Duration {
    Duration::from_millis(BASE_DELAY_MS << retry.min(MAX_EXPONENT))
}

/// Delay before the next reconnect attempt. Full jitter draws uniformly
/// from `[0, cap]` to spread simultaneous clients apart.
pub fn next_delay(strategy: &ReconnectDelay, retry: u32) -> Duration {
    match strategy {
        ReconnectDelay::Custom(f) => f(retry),
        ReconnectDelay::FullJitter => {
            let cap = delay_cap(retry);
            cap.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
        }
    }
}
