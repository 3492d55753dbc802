//! The counter subsystem.
//!
//! Two counter kinds share the identifier model: every tracked quantity is
//! addressed by `(app_id, name, field)`, with `app_id` and `name` free of
//! the comma used as the key separator, and `field` drawn from the
//! configured set. Active identifiers are tracked in sorted sets scored by
//! last-touch time, so counters can enumerate them without key scans and
//! expire idle ones.

pub mod periodic;
pub mod rolling;

pub use periodic::PeriodicCounter;
pub use rolling::RollingCounter;

use std::collections::HashMap;

use crate::error::{Result, StatsError};
use crate::store::FastStore;

/// Identifiers untouched for this long are evicted during `update()`.
pub const IDLE_EXPIRY_SECS: f64 = 10.0 * 24.0 * 3600.0;

/// Advisory-lock TTL guarding each counter's `update()`.
pub const MAX_UPDATE_SECS: u64 = 5 * 60;

/// Nested counter snapshot: `app_id -> name -> field -> sum`.
pub type CounterValues = HashMap<String, HashMap<String, HashMap<String, f64>>>;

/// Reject identifiers that would corrupt the comma-separated key layout.
pub(crate) fn check_identifier(app_id: &str, name: &str) -> Result<()> {
    if app_id.contains(',') {
        return Err(StatsError::InvalidAppId(app_id.to_string()));
    }
    if name.contains(',') {
        return Err(StatsError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Members of an active-id set, oldest first.
pub(crate) fn scan_members(store: &dyn FastStore, key: &str) -> Result<Vec<String>> {
    Ok(store
        .zset_scan(key)?
        .into_iter()
        .map(|(member, _)| member)
        .collect())
}

/// Members whose last-touch score is at or before `cutoff`.
pub(crate) fn expired_members(
    store: &dyn FastStore,
    key: &str,
    cutoff: f64,
) -> Result<Vec<String>> {
    Ok(store
        .zset_scan(key)?
        .into_iter()
        .filter(|(_, score)| *score <= cutoff)
        .map(|(member, _)| member)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_identifiers_are_rejected() {
        assert!(matches!(
            check_identifier("a,b", "x"),
            Err(StatsError::InvalidAppId(_))
        ));
        assert!(matches!(
            check_identifier("a", "x,y"),
            Err(StatsError::InvalidName(_))
        ));
        assert!(check_identifier("a", "x").is_ok());
    }
}
