//! Uniform command execution over a single node or a sharded cluster.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use indexmap::IndexSet;
use parking_lot::Mutex;
use redis::{Cmd, ErrorKind, FromRedisValue, Value};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::StorageResult;
use crate::error::StorageError;
use crate::scripts::{ScriptInfo, ScriptRegistry};
use crate::subscriptions::Subscriptions;
use crate::transport::{Topology, Transport, printable_args, split_command};

/// How long a fetched cluster id is trusted before it is read again.
pub const CLUSTER_ID_REFRESH: Duration = Duration::from_secs(60);

struct CachedClusterId {
    key: String,
    id: String,
    fetched_at: Instant,
}

/// Async command interface over one backend.
///
/// Commands whose name matches a registered script are executed by hash.
/// Multi-key commands a sharded backend rejects are emulated with per-key
/// commands when the transport reports [`Topology::Sharded`]; these
/// emulations are not atomic.
pub struct StorageAdapter {
    transport: Arc<dyn Transport>,
    scripts: ScriptRegistry,
    subscriptions: Subscriptions,
    cluster_id: Mutex<Option<CachedClusterId>>,
}

impl StorageAdapter {
    /// Creates an adapter with the bundled scripts registered.
    pub fn new(transport: Arc<dyn Transport>) -> StorageResult<Self> {
        Ok(Self::with_scripts(transport, ScriptRegistry::builtin()?))
    }

    pub fn with_scripts(transport: Arc<dyn Transport>, scripts: ScriptRegistry) -> Self {
        Self {
            subscriptions: Subscriptions::new(transport.clone()),
            transport,
            scripts,
            cluster_id: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> Topology {
        self.transport.topology()
    }

    fn is_sharded(&self) -> bool {
        self.transport.topology() == Topology::Sharded
    }

    /// Executes one command and decodes the reply.
    ///
    /// Faults are logged with the command and its arguments, then returned.
    pub async fn execute<T: FromRedisValue>(&self, cmd: &Cmd) -> StorageResult<T> {
        let (name, args) = split_command(cmd);
        let reply = match self.scripts.get(&name) {
            Some(script) => self.eval_script(script, &args).await,
            None => self.transport.query(cmd).await.map_err(|e| fault(&name, &args, e)),
        }?;
        redis::from_redis_value(&reply).map_err(|e| fault(&name, &args, e))
    }

    async fn eval_script(&self, script: &ScriptInfo, args: &[Vec<u8>]) -> StorageResult<Value> {
        let mut evalsha = redis::cmd("EVALSHA");
        evalsha
            .arg(&script.hash)
            .arg(script.key_count.resolve(args.len()));
        for arg in args {
            evalsha.arg(arg.as_slice());
        }

        match self.transport.query(&evalsha).await {
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                debug!(script = %script.name, "Script not cached by backend, loading");
                let mut load = redis::cmd("SCRIPT");
                load.arg("LOAD").arg(&script.source);
                if let Err(e) = self.transport.query(&load).await {
                    error!(script = %script.name, error = %e, "Script load failed");
                    return Err(StorageError::script_load(&script.name, e));
                }
                self.transport
                    .query(&evalsha)
                    .await
                    .map_err(|e| fault(&script.name, args, e))
            }
            other => other.map_err(|e| fault(&script.name, args, e)),
        }
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.execute(&Cmd::get(key)).await
    }

    /// Values in the order of `keys`.
    pub async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_sharded() {
            return try_join_all(keys.iter().map(|k| self.get(k))).await;
        }
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        self.execute(&cmd).await
    }

    /// `SET key value [PX millis] [NX]`; `false` when `NX` prevented the write.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        px: Option<u64>,
        nx: bool,
    ) -> StorageResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(millis) = px {
            cmd.arg("PX").arg(millis);
        }
        if nx {
            cmd.arg("NX");
        }
        let reply: Value = self.execute(&cmd).await?;
        Ok(matches!(reply, Value::Okay | Value::SimpleString(_)))
    }

    pub async fn del(&self, keys: &[String]) -> StorageResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        if self.is_sharded() {
            let counts = try_join_all(
                keys.iter()
                    .map(|k| async move { self.execute::<i64>(&Cmd::del(k)).await }),
            )
            .await?;
            return Ok(counts.into_iter().sum());
        }
        self.execute(&Cmd::del(keys)).await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> StorageResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.execute(&Cmd::sadd(key, members)).await
    }

    pub async fn srem(&self, key: &str, members: &[String]) -> StorageResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.execute(&Cmd::srem(key, members)).await
    }

    pub async fn smembers(&self, key: &str) -> StorageResult<Vec<String>> {
        self.execute(&Cmd::smembers(key)).await
    }

    /// Deduplicated union of the members of `keys`.
    pub async fn sunion(&self, keys: &[String]) -> StorageResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_sharded() {
            let sets = try_join_all(keys.iter().map(|k| self.smembers(k))).await?;
            let union: IndexSet<String> = sets.into_iter().flatten().collect();
            return Ok(union.into_iter().collect());
        }
        self.execute(&Cmd::sunion(keys)).await
    }

    pub async fn pexpire(&self, key: &str, millis: i64) -> StorageResult<bool> {
        self.execute(&Cmd::pexpire(key, millis)).await
    }

    pub async fn pttl(&self, key: &str) -> StorageResult<i64> {
        self.execute(&Cmd::pttl(key)).await
    }

    /// Raises the expiry of `keys[0]` to the largest remaining TTL among
    /// `keys`. Returns that TTL (`-2` when no key exists).
    pub async fn pexpiremax(&self, keys: &[String]) -> StorageResult<i64> {
        let Some(first) = keys.first() else {
            return Ok(-2);
        };
        if self.is_sharded() {
            let ttls = try_join_all(keys.iter().map(|k| self.pttl(k))).await?;
            let max = ttls.into_iter().fold(-2, i64::max);
            if max > 0 {
                self.pexpire(first, max).await?;
            }
            return Ok(max);
        }
        let mut cmd = redis::cmd("PEXPIREMAX");
        cmd.arg(keys);
        self.execute(&cmd).await
    }

    /// Moves every member of `source` into `destination` and deletes `source`.
    /// Returns the number of members moved.
    pub async fn smoveall(&self, source: &str, destination: &str) -> StorageResult<i64> {
        if self.is_sharded() {
            let members = self.smembers(source).await?;
            if !members.is_empty() {
                self.sadd(destination, &members).await?;
            }
            self.execute::<i64>(&Cmd::del(source)).await?;
            return Ok(members.len() as i64);
        }
        let mut cmd = redis::cmd("SMOVEALL");
        cmd.arg(source).arg(destination);
        self.execute(&cmd).await
    }

    pub async fn spop(&self, key: &str) -> StorageResult<Option<String>> {
        self.execute(&Cmd::spop(key)).await
    }

    pub async fn scard(&self, key: &str) -> StorageResult<i64> {
        self.execute(&Cmd::scard(key)).await
    }

    /// Matching keys across the whole backend.
    pub async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.execute(&Cmd::keys(pattern)).await
    }

    /// Deletes every key of the backend.
    pub async fn flush(&self) -> StorageResult<()> {
        let _: Value = self.execute(&redis::cmd("FLUSHDB")).await?;
        Ok(())
    }

    /// JSON-encodes `message` and publishes it. Returns the receiver count.
    pub async fn publish<M: Serialize + ?Sized>(
        &self,
        channel: &str,
        message: &M,
    ) -> StorageResult<i64> {
        let payload = serde_json::to_string(message)?;
        self.execute(&Cmd::publish(channel, payload)).await
    }

    /// Receives every JSON message published on `channel`.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> StorageResult<mpsc::UnboundedReceiver<serde_json::Value>> {
        self.subscriptions.subscribe(channel).await
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.unsubscribe_all();
    }

    /// The id stored under `key`, created on first use.
    ///
    /// A fetched id is reused for [`CLUSTER_ID_REFRESH`].
    #[instrument(skip(self))]
    pub async fn cluster_id(&self, key: &str) -> StorageResult<Option<String>> {
        if let Some(cached) = self.cluster_id.lock().as_ref() {
            if cached.key == key && cached.fetched_at.elapsed() < CLUSTER_ID_REFRESH {
                return Ok(Some(cached.id.clone()));
            }
        }

        let mut id = self.get(key).await?;
        if id.is_none() {
            let candidate = uuid::Uuid::new_v4().to_string();
            if self.set(key, &candidate, None, true).await? {
                debug!(id = %candidate, "Created cluster id");
            }
            id = self.get(key).await?;
        }

        match &id {
            Some(id) => {
                *self.cluster_id.lock() = Some(CachedClusterId {
                    key: key.to_string(),
                    id: id.clone(),
                    fetched_at: Instant::now(),
                });
            }
            None => error!(key, "Cluster id could not be created or read back"),
        }
        Ok(id)
    }
}

fn fault(command: &str, args: &[Vec<u8>], source: redis::RedisError) -> StorageError {
    let args = printable_args(args);
    if source.kind() == ErrorKind::NoScriptError {
        warn!(command, args = ?args, error = %source, "Script missing after reload");
    } else {
        error!(command, args = ?args, error = %source, "Backend command failed");
    }
    StorageError::backend(command, args, source)
}
