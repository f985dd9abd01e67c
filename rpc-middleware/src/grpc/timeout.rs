//! Effective per-call timeout and deadline.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::CallConfig;

/// Pick the timeout for `method`: a positive override, then a positive
/// per-method entry, then the default.
pub fn resolve(override_timeout: Option<Duration>, method: &str, config: &CallConfig) -> Duration {
    if let Some(timeout) = override_timeout.filter(|t| !t.is_zero()) {
        return timeout;
    }
    match config.for_method(method) {
        Some(entry) if !entry.timeout.is_zero() => entry.timeout,
        _ => config.timeout,
    }
}

/// Apply `timeout` to an existing deadline. The result is never later than
/// `existing`. A timeout past the clock's range leaves `existing` untouched.
pub fn shrink(existing: Option<Instant>, now: Instant, timeout: Duration) -> Option<Instant> {
    let Some(candidate) = now.checked_add(timeout) else {
        return existing;
    };
    match existing {
        Some(deadline) if deadline < candidate => Some(deadline),
        _ => Some(candidate),
    }
}
