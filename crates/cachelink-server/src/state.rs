use std::sync::Arc;

use cachelink_core::{CacheEngine, ClearCoordinator};
use serde_json::Value;

use crate::broadcast::{BroadcastResult, Broadcaster};
use crate::error::ApiError;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CacheEngine>,
    pub coordinator: ClearCoordinator,
    pub broadcaster: Arc<Broadcaster>,
}

impl AppState {
    pub fn new(coordinator: ClearCoordinator, broadcaster: Broadcaster) -> Self {
        Self {
            engine: coordinator.engine().clone(),
            coordinator,
            broadcaster: Arc::new(broadcaster),
        }
    }

    /// Forwards `operation` to sibling clusters, tagged with this cluster's id.
    pub async fn broadcast(
        &self,
        operation: &str,
        data: Value,
    ) -> Result<Option<BroadcastResult>, ApiError> {
        if !self.broadcaster.is_enabled() {
            return Ok(None);
        }
        let cluster_id = self.engine.cluster_id().await?.unwrap_or_default();
        Ok(self
            .broadcaster
            .broadcast(&cluster_id, operation, &data)
            .await)
    }
}
