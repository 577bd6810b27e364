//! HTTP routes.
//!
//! - `cache` - get, set, clear and the clear-later queue
//! - `broadcast` - operations forwarded by sibling clusters
//! - `system` - health and metrics

pub mod broadcast;
pub mod cache;
pub mod params;
pub mod system;
