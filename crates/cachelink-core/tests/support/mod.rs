//! A backend wrapper that fails chosen commands on demand.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cachelink_storage::{ChannelMessage, LocalStore, Topology, Transport};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use redis::{Cmd, ErrorKind, RedisError, RedisResult, Value};

/// Forwards to a [`LocalStore`] except for the commands marked as failing.
pub struct FaultyStore {
    inner: LocalStore,
    failing: Mutex<HashSet<String>>,
    short_mget: Mutex<bool>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalStore::new(),
            failing: Mutex::new(HashSet::new()),
            short_mget: Mutex::new(false),
        })
    }

    /// Every `command` fails until [`FaultyStore::heal`] is called.
    pub fn fail(&self, command: &str) {
        self.failing.lock().insert(command.to_ascii_uppercase());
    }

    pub fn heal(&self, command: &str) {
        self.failing.lock().remove(&command.to_ascii_uppercase());
    }

    /// `MGET` answers with one value fewer than the keys it was asked for.
    pub fn drop_last_mget_value(&self) {
        *self.short_mget.lock() = true;
    }
}

#[async_trait]
impl Transport for FaultyStore {
    async fn query(&self, cmd: &Cmd) -> RedisResult<Value> {
        let (name, _) = cachelink_storage::split_command(cmd);
        if self.failing.lock().contains(&name) {
            return Err(RedisError::from((
                ErrorKind::IoError,
                "connection refused",
                name,
            )));
        }
        let reply = self.inner.query(cmd).await?;
        match reply {
            Value::Array(mut items) if name == "MGET" && *self.short_mget.lock() => {
                items.pop();
                Ok(Value::Array(items))
            }
            other => Ok(other),
        }
    }

    fn topology(&self) -> Topology {
        self.inner.topology()
    }

    async fn open_messages(
        &self,
        channels: &[String],
    ) -> RedisResult<BoxStream<'static, ChannelMessage>> {
        self.inner.open_messages(channels).await
    }
}
