//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp as fractional seconds.
///
/// Event envelopes carry float-second timestamps on the wire. Returns 0.0 if
/// the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
