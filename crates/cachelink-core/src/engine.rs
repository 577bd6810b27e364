//! Cache operations over the association graph.
//!
//! Keys (all prefixed per deployment):
//! - `d:{key}` the JSON-encoded value, with the entry's TTL
//! - `i:{key}` the set of keys `key` was associated with, with the same TTL
//! - `c:{member}` the set of keys associated with `member`; its TTL only grows
//!
//! Clearing a key clears every key whose entry named it as an association,
//! level by level, until the requested depth or until no unseen key remains.

use std::sync::Arc;

use cachelink_storage::{StorageAdapter, StorageError};
use futures_util::future::{join_all, try_join_all};
use indexmap::IndexSet;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::metrics;
use crate::types::{
    ClearDepth, ClearLaterOutcome, ClearLevel, ClearReport, SetOutcome, SetRequest, Step,
};

/// Names and sizes the engine works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Prepended to every key the engine touches.
    pub prefix: String,
    pub clear_later_set: String,
    pub clear_now_set: String,
    /// Keys popped from the clear-now set per drain iteration.
    pub clear_batch_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            clear_later_set: "___clear_later_set".to_string(),
            clear_now_set: "___clear_now_set".to_string(),
            clear_batch_size: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct KeySpace {
    data: String,
    in_set: String,
    contains: String,
    clear_later: String,
    clear_now: String,
    cluster_id: String,
}

impl KeySpace {
    fn new(settings: &CacheSettings) -> Self {
        let prefix = &settings.prefix;
        Self {
            data: format!("{prefix}d:"),
            in_set: format!("{prefix}i:"),
            contains: format!("{prefix}c:"),
            clear_later: format!("{prefix}{}", settings.clear_later_set),
            clear_now: format!("{prefix}{}", settings.clear_now_set),
            cluster_id: format!("{prefix}__cachelink_cluster_id"),
        }
    }

    fn data(&self, key: &str) -> String {
        format!("{}{key}", self.data)
    }

    fn in_set(&self, key: &str) -> String {
        format!("{}{key}", self.in_set)
    }

    fn contains(&self, key: &str) -> String {
        format!("{}{key}", self.contains)
    }
}

/// Keyed storage with cascading invalidation and a deferred-clear queue.
pub struct CacheEngine {
    storage: Arc<StorageAdapter>,
    settings: CacheSettings,
    keys: KeySpace,
}

impl CacheEngine {
    pub fn new(storage: Arc<StorageAdapter>, mut settings: CacheSettings) -> Self {
        settings.clear_batch_size = settings.clear_batch_size.max(1);
        let keys = KeySpace::new(&settings);
        Self {
            storage,
            settings,
            keys,
        }
    }

    pub fn storage(&self) -> &Arc<StorageAdapter> {
        &self.storage
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Backend key of the clear-later set.
    pub fn clear_later_key(&self) -> &str {
        &self.keys.clear_later
    }

    /// Backend key of the clear-now set.
    pub fn clear_now_key(&self) -> &str {
        &self.keys.clear_now
    }

    /// The value stored under `key`, if present and not expired.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        if key.is_empty() {
            return Err(CacheError::validation("must provide a \"key\" to get"));
        }
        debug!(key, "cache: get");
        let raw = self.storage.get(&self.keys.data(key)).await?;
        Ok(raw.map(decode))
    }

    /// Values for `keys`, positionally.
    pub async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Err(CacheError::validation("must provide \"keys\" to getMany"));
        }
        debug!(count = keys.len(), "cache: getMany");
        let data_keys: Vec<String> = keys.iter().map(|k| self.keys.data(k)).collect();
        let raw = self.storage.mget(&data_keys).await?;
        if raw.len() != keys.len() {
            error!(
                keys = ?data_keys,
                expected = keys.len(),
                actual = raw.len(),
                "cache: mget reply count mismatch"
            );
            return Err(CacheError::CountMismatch {
                expected: keys.len(),
                actual: raw.len(),
            });
        }
        Ok(raw.into_iter().map(|v| v.map(decode)).collect())
    }

    /// Writes an entry and its associations.
    ///
    /// Backend failures in individual steps are reported in the outcome and
    /// do not abort the remaining steps.
    pub async fn set(&self, req: &SetRequest) -> CacheResult<SetOutcome> {
        if req.key.is_empty() {
            return Err(CacheError::validation("must provide a \"key\" to set"));
        }
        let Some(data) = &req.data else {
            return Err(CacheError::validation("must provide \"data\" to set"));
        };
        if req.millis == 0 {
            return Err(CacheError::validation("must provide a \"millis\" TTL"));
        }
        let ttl = i64::try_from(req.millis)
            .map_err(|_| CacheError::validation("\"millis\" TTL is out of range"))?;

        let key = req.key.as_str();
        let millis = req.millis;
        let payload = serde_json::to_string(data).map_err(StorageError::from)?;
        let data_key = self.keys.data(key);
        let in_key = self.keys.in_set(key);
        debug!(key, millis, associations = req.associations.len(), "cache: set");

        let (cache_set, clear_assoc_in) = tokio::join!(
            self.storage.set(&data_key, &payload, Some(millis), false),
            self.storage.del(std::slice::from_ref(&in_key)),
        );
        let mut outcome = SetOutcome {
            success: false,
            cache_set: cache_set.into(),
            clear_assoc_in: clear_assoc_in.into(),
            assoc_in: None,
            expire_assoc_in: None,
            assoc_contains: Vec::new(),
            expire_assoc_contains: Vec::new(),
        };

        if !req.associations.is_empty() {
            let data_key = &data_key;
            let in_key = &in_key;

            let associate_in = async {
                let added = self.storage.sadd(in_key, &req.associations).await;
                let expired: Step<bool> = match &added {
                    Ok(_) => self.storage.pexpire(in_key, ttl).await.into(),
                    Err(e) => skipped(e),
                };
                (Step::from(added), expired)
            };

            let associate_contains = join_all(req.associations.iter().map(|member| async move {
                let contains_key = self.keys.contains(member);
                let added = self
                    .storage
                    .sadd(&contains_key, std::slice::from_ref(&req.key))
                    .await;
                let expired: Step<i64> = match &added {
                    Ok(_) => self
                        .storage
                        .pexpiremax(&[contains_key, data_key.clone()])
                        .await
                        .into(),
                    Err(e) => skipped(e),
                };
                (Step::from(added), expired)
            }));

            let ((assoc_in, expire_assoc_in), members) =
                tokio::join!(associate_in, associate_contains);
            outcome.assoc_in = Some(assoc_in);
            outcome.expire_assoc_in = Some(expire_assoc_in);
            let (contains, expires): (Vec<_>, Vec<_>) = members.into_iter().unzip();
            outcome.assoc_contains = contains;
            outcome.expire_assoc_contains = expires;
        }

        outcome.success = set_succeeded(&outcome, !req.associations.is_empty());
        if !outcome.success {
            warn!(key, outcome = ?outcome, "cache: set not fully applied");
        }
        Ok(outcome)
    }

    /// Clears `keys` and the keys that depend on them, up to `depth` levels.
    ///
    /// Every key is processed at most once per call, so association cycles
    /// terminate.
    pub async fn clear(&self, keys: &[String], depth: ClearDepth) -> CacheResult<ClearReport> {
        if keys.is_empty() {
            return Err(CacheError::validation("must provide \"keys\" to clear"));
        }

        let max_level = depth.max_level();
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut levels = Vec::new();
        let mut frontier: Vec<String> = keys.to_vec();
        let mut level: u32 = 1;

        loop {
            let fresh: Vec<String> = frontier
                .into_iter()
                .filter(|k| seen.insert(k.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            debug!(level, count = fresh.len(), "cache: clear level");

            let data_keys: Vec<String> = fresh.iter().map(|k| self.keys.data(k)).collect();
            let in_keys: Vec<String> = fresh.iter().map(|k| self.keys.in_set(k)).collect();
            let contains_keys: Vec<String> = fresh.iter().map(|k| self.keys.contains(k)).collect();
            let cascade = level <= max_level;

            let (cleared, keys_contains, keys_next_level) = tokio::try_join!(
                self.storage.del(&data_keys),
                self.storage.sunion(&in_keys),
                async {
                    if cascade {
                        self.storage.sunion(&contains_keys).await
                    } else {
                        Ok(Vec::new())
                    }
                },
            )?;

            let fresh_ref = &fresh;
            let (keys_in_deleted, removed) = tokio::try_join!(
                self.storage.del(&in_keys),
                try_join_all(keys_contains.iter().map(|member| async move {
                    self.storage
                        .srem(&self.keys.contains(member), fresh_ref)
                        .await
                })),
            )?;

            frontier = keys_next_level.clone();
            levels.push(ClearLevel {
                level,
                keys_count: fresh.len(),
                keys: fresh,
                cleared,
                keys_contains,
                removed_from_contains: removed.into_iter().sum(),
                keys_in_deleted,
                keys_next_level,
            });

            if frontier.is_empty() {
                break;
            }
            level += 1;
        }

        let all_keys_cleared: Vec<String> = seen.into_iter().collect();
        metrics::record_keys_cleared(all_keys_cleared.len());
        debug!(
            levels = levels.len(),
            cleared = all_keys_cleared.len(),
            "cache: clear complete"
        );
        Ok(ClearReport {
            success: true,
            levels,
            all_keys_cleared,
        })
    }

    /// Queues `keys` for the next coordinated clear.
    pub async fn clear_later(&self, keys: &[String]) -> CacheResult<ClearLaterOutcome> {
        if keys.is_empty() {
            return Err(CacheError::validation("must provide \"keys\" to clear later"));
        }
        debug!(count = keys.len(), "cache: clearLater");
        let added = self.storage.sadd(&self.keys.clear_later, keys).await?;
        metrics::record_clear_later_queued(added);
        Ok(ClearLaterOutcome {
            success: added > 0,
            added,
        })
    }

    /// Drains the clear-now set in batches, clearing every level of each batch.
    ///
    /// Returns the keys cleared per batch. Stops after the first batch that
    /// pops fewer keys than the batch size.
    pub async fn clear_now(&self) -> CacheResult<Vec<Vec<String>>> {
        let batch = self.settings.clear_batch_size;
        let mut cleared_by_batch = Vec::new();

        loop {
            let popped =
                try_join_all((0..batch).map(|_| self.storage.spop(&self.keys.clear_now))).await?;
            let keys: Vec<String> = popped.into_iter().flatten().collect();
            if keys.is_empty() {
                break;
            }
            debug!(count = keys.len(), "cache: clearNow batch");

            let report = self.clear(&keys, ClearDepth::All).await?;
            cleared_by_batch.push(report.all_keys_cleared);
            if keys.len() < batch {
                break;
            }
        }

        info!(batches = cleared_by_batch.len(), "cache: clearNow complete");
        Ok(cleared_by_batch)
    }

    pub async fn clear_later_count(&self) -> CacheResult<i64> {
        Ok(self.storage.scard(&self.keys.clear_later).await?)
    }

    pub async fn clear_now_count(&self) -> CacheResult<i64> {
        Ok(self.storage.scard(&self.keys.clear_now).await?)
    }

    /// This storage cluster's id, created on first use.
    pub async fn cluster_id(&self) -> CacheResult<Option<String>> {
        Ok(self.storage.cluster_id(&self.keys.cluster_id).await?)
    }

    /// Removes every key from the backend.
    pub async fn flush(&self) -> CacheResult<()> {
        warn!("cache: flushing all keys");
        Ok(self.storage.flush().await?)
    }
}

fn decode(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

fn skipped<T>(cause: &StorageError) -> Step<T> {
    Step::Failed {
        error: format!("skipped: {cause}"),
    }
}

fn set_succeeded(outcome: &SetOutcome, associated: bool) -> bool {
    let written = matches!(outcome.cache_set, Step::Done(true));
    if !associated {
        return written;
    }
    written
        && matches!(outcome.assoc_in, Some(Step::Done(n)) if n > 0)
        && matches!(outcome.expire_assoc_in, Some(Step::Done(true)))
        && outcome.assoc_contains.iter().all(Step::is_done)
        && outcome.expire_assoc_contains.iter().all(Step::is_done)
}
