//! Counters recorded by the engine and the coordinator.
//!
//! Recorded through the `metrics` facade; the binary installs the exporter.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const KEYS_CLEARED_TOTAL: &str = "cachelink_keys_cleared_total";
    pub const CLEAR_LATER_QUEUED_TOTAL: &str = "cachelink_clear_later_queued_total";
    pub const DRAINS_TOTAL: &str = "cachelink_drains_total";
    pub const LEASES_WON_TOTAL: &str = "cachelink_leases_won_total";
    pub const KEYS_MIGRATED_TOTAL: &str = "cachelink_keys_migrated_total";
}

pub(crate) fn record_keys_cleared(count: usize) {
    counter!(names::KEYS_CLEARED_TOTAL).increment(count as u64);
}

pub(crate) fn record_clear_later_queued(added: i64) {
    counter!(names::CLEAR_LATER_QUEUED_TOTAL).increment(added.max(0) as u64);
}

pub(crate) fn record_drain(outcome: &'static str) {
    counter!(names::DRAINS_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn record_lease_won() {
    counter!(names::LEASES_WON_TOTAL).increment(1);
}

pub(crate) fn record_keys_migrated(count: i64) {
    counter!(names::KEYS_MIGRATED_TOTAL).increment(count.max(0) as u64);
}
