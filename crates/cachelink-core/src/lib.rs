//! # cachelink-core
//!
//! The cache engine and the clear coordinator.
//!
//! [`CacheEngine`] stores JSON values with a TTL and an optional list of
//! associated keys. Clearing a key also clears every entry that was
//! associated with it, transitively, up to a [`ClearDepth`]. Keys can be
//! queued with [`CacheEngine::clear_later`] and are then cleared in bulk.
//!
//! [`ClearCoordinator`] drains that queue across a fleet: once per interval
//! one instance wins a lease, moves the queue into the active set and
//! publishes a trigger so every instance drains it.

mod coordinator;
mod engine;
mod error;
pub mod metrics;
mod types;

pub use coordinator::{
    ClearCoordinator, CoordinatorSettings, Drain, DrainOutcome, START_CLEAR_MESSAGE,
};
pub use engine::{CacheEngine, CacheSettings};
pub use error::{CacheError, CacheResult};
pub use types::{
    ClearDepth, ClearLaterOutcome, ClearLaterRequest, ClearLevel, ClearReport, ClearRequest,
    MAX_CLEAR_LEVELS, SetOutcome, SetRequest, Step,
};
