//! Cache operations over HTTP.
//!
//! Mutating routes broadcast to sibling clusters alongside the local
//! operation and attach the aggregate as `broadcastResult`. A truthy
//! `background` parameter answers `{"background": true}` at once and leaves
//! the work running.

use std::future::Future;

use axum::{Json, extract::State};
use cachelink_core::{ClearDepth, ClearLaterRequest, ClearRequest, SetRequest};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::error;

use super::params::Params;
use crate::broadcast::BroadcastResult;
use crate::error::ApiError;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

pub async fn get_one(State(state): State<AppState>, params: Params) -> ApiResult {
    let key = params.text(&["key"]).unwrap_or_default();
    let value = state.engine.get(&key).await?;
    Ok(Json(value.unwrap_or(Value::Null)))
}

/// Answers an object keyed by requested key.
pub async fn get_many(State(state): State<AppState>, params: Params) -> ApiResult {
    let keys = params.keys();
    let values = state.engine.get_many(&keys).await?;
    let by_key: Map<String, Value> = keys
        .into_iter()
        .zip(values)
        .map(|(k, v)| (k, v.unwrap_or(Value::Null)))
        .collect();
    Ok(Json(Value::Object(by_key)))
}

pub async fn set(State(state): State<AppState>, params: Params) -> ApiResult {
    let request = SetRequest {
        key: params.text(&["key"]).unwrap_or_default(),
        data: params.payload("data"),
        millis: params.ttl_millis(),
        associations: params.list(&["assoc", "associations"]),
    };
    let broadcast = params.flag("broadcast");

    respond(params.flag("background"), async move {
        let data = serde_json::to_value(&request)?;
        let (outcome, broadcast) = tokio::join!(state.engine.set(&request), async {
            if broadcast {
                state.broadcast("set", data).await
            } else {
                Ok(None)
            }
        });
        with_broadcast(&outcome?, broadcast?)
    })
    .await
}

pub async fn clear(State(state): State<AppState>, params: Params) -> ApiResult {
    let levels = match params.text(&["levels"]) {
        Some(levels) => levels.parse::<ClearDepth>()?,
        None => ClearDepth::All,
    };
    let request = ClearRequest {
        keys: params.keys(),
        levels,
    };
    let local = params.flag("local");

    respond(params.flag("background"), async move {
        let data = serde_json::to_value(&request)?;
        let (report, broadcast) = tokio::join!(
            state.engine.clear(&request.keys, request.levels),
            broadcast_unless(&state, local, "clear", data)
        );
        with_broadcast(&report?, broadcast?)
    })
    .await
}

pub async fn clear_later(State(state): State<AppState>, params: Params) -> ApiResult {
    let request = ClearLaterRequest {
        keys: params.keys(),
    };
    let local = params.flag("local");

    respond(params.flag("background"), async move {
        let data = serde_json::to_value(&request)?;
        let (outcome, broadcast) = tokio::join!(
            state.engine.clear_later(&request.keys),
            broadcast_unless(&state, local, "clear-later", data)
        );
        with_broadcast(&outcome?, broadcast?)
    })
    .await
}

/// Migrates the clear-later queue now instead of waiting for the next tick.
pub async fn clear_now(State(state): State<AppState>, params: Params) -> ApiResult {
    let local = params.flag("local");

    respond(params.flag("background"), async move {
        let (started, broadcast) = tokio::join!(
            state.coordinator.start_clear_now_process(),
            broadcast_unless(&state, local, "clear-now", Value::Null)
        );
        with_broadcast(&json!({ "started": started? }), broadcast?)
    })
    .await
}

pub async fn clear_counts(State(state): State<AppState>) -> ApiResult {
    let (later, now) = tokio::try_join!(
        state.engine.clear_later_count(),
        state.engine.clear_now_count()
    )?;
    Ok(Json(json!({
        "clearLaterCount": later,
        "clearNowCount": now,
    })))
}

async fn broadcast_unless(
    state: &AppState,
    local: bool,
    operation: &str,
    data: Value,
) -> Result<Option<BroadcastResult>, ApiError> {
    if local {
        return Ok(None);
    }
    state.broadcast(operation, data).await
}

fn with_broadcast(
    outcome: &impl Serialize,
    broadcast: Option<BroadcastResult>,
) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(outcome)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "broadcastResult".to_string(),
            serde_json::to_value(broadcast)?,
        );
    }
    Ok(value)
}

async fn respond<F>(background: bool, work: F) -> ApiResult
where
    F: Future<Output = Result<Value, ApiError>> + Send + 'static,
{
    if !background {
        return work.await.map(Json);
    }
    tokio::spawn(async move {
        if let Err(e) = work.await {
            error!(error = %e, "Background operation failed");
        }
    });
    Ok(Json(json!({ "background": true })))
}
