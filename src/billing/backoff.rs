//! Exponential backoff with jitter, shared by the provider client and the
//! reconciliation retry loop.

use std::time::Duration;

/// Delay before retry number `attempt` (zero-based).
///
/// `base_ms * 2^attempt`, capped at `max_ms`, plus 0-25% jitter.
#[must_use]
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}
