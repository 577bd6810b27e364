//! Forwards mutating operations to sibling cachelink clusters.
//!
//! Every configured target receives `POST {base}/broadcast/{operation}` with
//! the operation's JSON payload. The sender's cluster id travels in the
//! [`CLUSTER_HEADER`] header so a cluster can reject its own broadcasts.

use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::config::BasicAuthConfig;
use crate::metrics;

/// Carries the sending cluster's id.
pub const CLUSTER_HEADER: &str = "x-postable-cluster";

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("invalid URL (must start with \"http://\" or \"https://\") in broadcast[{index}]")]
    Scheme { index: usize },

    #[error("invalid URL (must not contain a path portion) in broadcast[{index}]")]
    Path { index: usize },

    #[error("invalid URL in broadcast[{index}]: {source}")]
    Parse {
        index: usize,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build broadcast client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Checks a target base URL and returns it without a trailing slash.
pub fn validate_target(index: usize, target: &str) -> Result<String, BroadcastError> {
    let lower = target.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(BroadcastError::Scheme { index });
    }
    let url = Url::parse(target).map_err(|source| BroadcastError::Parse { index, source })?;
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(BroadcastError::Path { index });
    }
    Ok(target.trim_end_matches('/').to_string())
}

/// HTTP status of one target, or a marker for a request that never completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BroadcastStatus {
    Code(u16),
    Failed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastResponse {
    pub status: BroadcastStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl BroadcastResponse {
    fn failed() -> Self {
        Self {
            status: BroadcastStatus::Failed("broadcast_failed"),
            body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BroadcastStatus::Code(200)
    }
}

/// Aggregate of one fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    pub operation: String,
    pub data: Value,
    /// Targets that errored or answered with anything but 200.
    pub failed_count: usize,
    /// Keyed by the URL posted to, in target order.
    pub responses: IndexMap<String, BroadcastResponse>,
}

pub struct Broadcaster {
    client: reqwest::Client,
    targets: Vec<String>,
    auth: Option<BasicAuthConfig>,
}

impl Broadcaster {
    pub fn new(
        targets: &[String],
        timeout: Duration,
        auth: Option<BasicAuthConfig>,
    ) -> Result<Self, BroadcastError> {
        let targets = targets
            .iter()
            .enumerate()
            .map(|(i, t)| validate_target(i, t))
            .collect::<Result<Vec<_>, _>>()?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            targets,
            auth,
        })
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Posts `data` to every target in parallel.
    ///
    /// Returns `None` when no targets are configured. Failures are counted,
    /// never raised.
    pub async fn broadcast(
        &self,
        cluster_id: &str,
        operation: &str,
        data: &Value,
    ) -> Option<BroadcastResult> {
        if self.targets.is_empty() {
            return None;
        }

        let sends = self.targets.iter().map(|base| {
            let url = format!("{base}/broadcast/{operation}");
            async move {
                let response = self.post(&url, cluster_id, data).await;
                (url, response)
            }
        });
        let responses: IndexMap<String, BroadcastResponse> =
            join_all(sends).await.into_iter().collect();

        let failed_count = responses.values().filter(|r| !r.is_success()).count();
        metrics::record_broadcast(operation, failed_count);

        Some(BroadcastResult {
            operation: operation.to_string(),
            data: data.clone(),
            failed_count,
            responses,
        })
    }

    async fn post(&self, url: &str, cluster_id: &str, data: &Value) -> BroadcastResponse {
        debug!(url, "Broadcasting");
        let mut request = self
            .client
            .post(url)
            .header(CLUSTER_HEADER, cluster_id)
            .json(data);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(&auth.pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(url, error = %e, "Broadcast failed");
                return BroadcastResponse::failed();
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) if text.is_empty() => None,
            Ok(text) => Some(serde_json::from_str(&text).unwrap_or(Value::String(text))),
            Err(e) => {
                error!(url, status, error = %e, "Broadcast response unreadable");
                return BroadcastResponse::failed();
            }
        };

        if status == 200 {
            debug!(url, "Broadcast delivered");
        } else {
            error!(url, status, body = ?body, "Broadcast rejected");
        }
        BroadcastResponse {
            status: BroadcastStatus::Code(status),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_target() {
        assert_eq!(
            validate_target(0, "http://cache-b:3111/").unwrap(),
            "http://cache-b:3111"
        );
        assert_eq!(
            validate_target(0, "https://cache-b").unwrap(),
            "https://cache-b"
        );
        let err = validate_target(2, "cache-b:3111").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid URL (must start with \"http://\" or \"https://\") in broadcast[2]"
        );
        let err = validate_target(1, "http://cache-b/api").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid URL (must not contain a path portion) in broadcast[1]"
        );
    }

    #[tokio::test]
    async fn test_no_targets_yields_none() {
        let broadcaster = Broadcaster::new(&[], Duration::from_secs(1), None).unwrap();
        assert!(!broadcaster.is_enabled());
        assert!(
            broadcaster
                .broadcast("id", "clear", &serde_json::json!({"keys": ["a"]}))
                .await
                .is_none()
        );
    }

    #[test]
    fn test_result_serialization() {
        let mut responses = IndexMap::new();
        responses.insert(
            "http://a/broadcast/clear".to_string(),
            BroadcastResponse {
                status: BroadcastStatus::Code(200),
                body: Some(serde_json::json!({"success": true})),
            },
        );
        responses.insert(
            "http://b/broadcast/clear".to_string(),
            BroadcastResponse::failed(),
        );
        let result = BroadcastResult {
            operation: "clear".into(),
            data: serde_json::json!({"keys": ["a"]}),
            failed_count: 1,
            responses,
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "operation": "clear",
                "data": {"keys": ["a"]},
                "failedCount": 1,
                "responses": {
                    "http://a/broadcast/clear": {"status": 200, "body": {"success": true}},
                    "http://b/broadcast/clear": {"status": "broadcast_failed"}
                }
            })
        );
    }
}
