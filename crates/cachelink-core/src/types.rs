//! Requests and outcome records exchanged with callers.
//!
//! Field names serialize in camelCase; these records are returned verbatim
//! over HTTP and posted to sibling clusters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::CacheError;

/// Upper bound on cascade levels for [`ClearDepth::All`].
pub const MAX_CLEAR_LEVELS: u32 = 1_000_000;

/// How far a clear cascades through dependent keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearDepth {
    /// Only the given keys.
    None,
    /// The given keys plus this many further levels.
    Levels(u32),
    /// Every reachable dependent key.
    #[default]
    All,
}

impl ClearDepth {
    /// Last level after which no further level is fetched.
    pub fn max_level(self) -> u32 {
        match self {
            ClearDepth::None => 0,
            ClearDepth::Levels(n) => n,
            ClearDepth::All => MAX_CLEAR_LEVELS,
        }
    }
}

impl FromStr for ClearDepth {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(ClearDepth::None),
            "all" | "" => Ok(ClearDepth::All),
            other => other
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(|n| ClearDepth::Levels(n.floor().clamp(0.0, MAX_CLEAR_LEVELS as f64) as u32))
                .ok_or_else(|| {
                    CacheError::validation(format!(
                        "invalid \"levels\" value \"{other}\" (expected \"none\", \"all\" or a number)"
                    ))
                }),
        }
    }
}

impl fmt::Display for ClearDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearDepth::None => f.write_str("none"),
            ClearDepth::Levels(n) => write!(f, "{n}"),
            ClearDepth::All => f.write_str("all"),
        }
    }
}

impl Serialize for ClearDepth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ClearDepth::Levels(n) => serializer.serialize_u32(*n),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ClearDepth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ClearDepth::Levels(
                n.max(0.0).floor().min(MAX_CLEAR_LEVELS as f64) as u32,
            )),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Input to [`crate::CacheEngine::set`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRequest {
    pub key: String,
    /// `None` when the caller sent no data at all; an explicit `null` is kept.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    /// Time to live in milliseconds.
    pub millis: u64,
    /// Keys this entry depends on. Clearing any of them clears this entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<String>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Input to [`crate::CacheEngine::clear`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearRequest {
    pub keys: Vec<String>,
    #[serde(default)]
    pub levels: ClearDepth,
}

/// Input to [`crate::CacheEngine::clear_later`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearLaterRequest {
    pub keys: Vec<String>,
}

/// The result of one backend step: its reply, or the error it failed with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Step<T> {
    Done(T),
    Failed { error: String },
}

impl<T> Step<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Step::Done(v) => Some(v),
            Step::Failed { .. } => None,
        }
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for Step<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Step::Done(v),
            Err(e) => Step::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// Per-step report of a [`crate::CacheEngine::set`].
///
/// A failed step does not abort the others; `success` aggregates them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOutcome {
    pub success: bool,
    /// Whether the data key was written.
    pub cache_set: Step<bool>,
    /// Number of previous in-sets deleted (0 or 1).
    pub clear_assoc_in: Step<i64>,
    /// Members added to the in-set. `None` without associations.
    pub assoc_in: Option<Step<i64>>,
    pub expire_assoc_in: Option<Step<bool>>,
    /// One entry per association, in request order.
    pub assoc_contains: Vec<Step<i64>>,
    /// The contains-set TTL after each raise.
    pub expire_assoc_contains: Vec<Step<i64>>,
}

/// What happened at one cascade level of a clear.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearLevel {
    /// Starts at 1.
    pub level: u32,
    /// Keys first seen at this level.
    pub keys: Vec<String>,
    pub keys_count: usize,
    /// Data entries deleted.
    pub cleared: i64,
    /// Members whose contains-sets were updated.
    pub keys_contains: Vec<String>,
    /// Entries removed from those contains-sets.
    pub removed_from_contains: i64,
    /// In-sets deleted.
    pub keys_in_deleted: i64,
    /// Dependents scheduled for the next level.
    pub keys_next_level: Vec<String>,
}

/// Report of a [`crate::CacheEngine::clear`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub success: bool,
    /// One record per level, level 1 first.
    pub levels: Vec<ClearLevel>,
    /// Every key cleared, each once, in the order first reached.
    pub all_keys_cleared: Vec<String>,
}

/// Result of a [`crate::CacheEngine::clear_later`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearLaterOutcome {
    pub success: bool,
    /// Keys newly queued; keys already queued are not counted.
    pub added: i64,
}
