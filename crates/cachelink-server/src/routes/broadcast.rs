//! Receiving end of a sibling cluster's broadcast.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use cachelink_core::{ClearLaterRequest, ClearRequest, SetRequest};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::broadcast::CLUSTER_HEADER;
use crate::error::ApiError;
use crate::state::AppState;

const OPERATIONS: [&str; 4] = ["set", "clear", "clear-later", "clear-now"];

/// Applies a broadcast operation locally. Never re-broadcasts.
pub async fn receive(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let cluster_id = state.engine.cluster_id().await?;
    let sender = headers.get(CLUSTER_HEADER).and_then(|v| v.to_str().ok());
    if sender.is_some() && sender == cluster_id.as_deref() {
        tracing::warn!(operation = %operation, "Rejected broadcast from this cluster");
        return Err(ApiError::SameCluster);
    }
    if !OPERATIONS.contains(&operation.as_str()) {
        return Err(ApiError::NoSuchOperation);
    }
    tracing::debug!(operation = %operation, sender = ?sender, "Received broadcast");

    let result = match operation.as_str() {
        "set" => {
            let request: SetRequest = decode(&body)?;
            serde_json::to_value(state.engine.set(&request).await?)?
        }
        "clear" => {
            let request: ClearRequest = decode(&body)?;
            serde_json::to_value(state.engine.clear(&request.keys, request.levels).await?)?
        }
        "clear-later" => {
            let request: ClearLaterRequest = decode(&body)?;
            serde_json::to_value(state.engine.clear_later(&request.keys).await?)?
        }
        _ => json!({ "started": state.coordinator.start_clear_now_process().await? }),
    };
    Ok(Json(result))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid broadcast payload: {e}")))
}
