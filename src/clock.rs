//! Wall-clock helpers.
//!
//! Counter mutations take explicit epoch-second timestamps (`*_at`
//! variants) so tests can drive time; these helpers feed the non-`_at`
//! wrappers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds, fractional.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Current Unix time in whole seconds.
pub fn now_secs() -> i64 {
    now_ts() as i64
}
