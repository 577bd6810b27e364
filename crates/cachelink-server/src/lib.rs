//! HTTP front end for a cachelink cluster.
//!
//! Serves the cache routes over a [`cachelink_core::CacheEngine`], runs the
//! [`cachelink_core::ClearCoordinator`] background tasks and forwards
//! mutating operations to sibling clusters.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod routes;
pub mod server;
pub mod state;

pub use broadcast::{BroadcastResult, Broadcaster};
pub use config::AppConfig;
pub use error::ApiError;
pub use server::{CachelinkServer, ServerBuilder, build_app, connect_storage};
pub use state::AppState;
