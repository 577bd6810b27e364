//! # cachelink-storage
//!
//! Command execution layer for cachelink.
//!
//! [`StorageAdapter`] presents one async command interface over either a
//! single Redis node or a sharded Redis cluster:
//! - server-side Lua scripts are invoked by hash and loaded on a miss
//! - multi-key commands a cluster rejects are emulated per key
//! - pub/sub channels are multiplexed over one subscriber connection
//!
//! Backends implement [`Transport`]. [`RedisTransport`] talks to Redis through
//! `deadpool-redis`; [`LocalStore`] keeps everything in process.
//!
//! ```ignore
//! use std::sync::Arc;
//! use cachelink_storage::{LocalStore, StorageAdapter};
//!
//! let adapter = StorageAdapter::new(Arc::new(LocalStore::new()))?;
//! adapter.sadd("later", &["a".to_string()]).await?;
//! let moved = adapter.smoveall("later", "now").await?;
//! ```

mod adapter;
mod error;
mod local;
mod redis;
mod scripts;
mod subscriptions;
mod transport;

pub use adapter::{CLUSTER_ID_REFRESH, StorageAdapter};
pub use error::{ErrorCategory, StorageError};
pub use local::LocalStore;
pub use redis::{RedisOptions, RedisTransport};
pub use scripts::{KeyCount, ScriptInfo, ScriptRegistry};
pub use transport::{ChannelMessage, Topology, Transport, split_command};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
