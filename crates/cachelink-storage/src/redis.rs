//! Redis transport backed by `deadpool-redis`.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{PoolConfig, Runtime, Timeouts};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::{Cmd, ErrorKind, RedisError, RedisResult, Value};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::transport::{ChannelMessage, Topology, Transport};

/// Connection settings for [`RedisTransport::connect`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// `redis://` URLs. A sharded deployment lists its seed nodes.
    pub nodes: Vec<String>,
    pub topology: Topology,
    pub pool_size: usize,
    /// Applied to pool checkout, connection creation and recycling.
    pub timeout: Duration,
}

impl RedisOptions {
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            nodes: vec![url.into()],
            topology: Topology::Single,
            pool_size: 16,
            timeout: Duration::from_secs(5),
        }
    }
}

enum Pool {
    Single(deadpool_redis::Pool),
    Cluster(deadpool_redis::cluster::Pool),
}

/// A pooled connection to one Redis node or one Redis cluster.
pub struct RedisTransport {
    pool: Pool,
    /// Subscriber connections cannot live in the pool.
    pubsub_url: String,
    topology: Topology,
}

impl RedisTransport {
    /// Builds the pool and checks out one connection to verify reachability.
    pub async fn connect(options: RedisOptions) -> Result<Self, StorageError> {
        let Some(first) = options.nodes.first().cloned() else {
            return Err(StorageError::config("redis: no nodes configured"));
        };

        let pool_config = PoolConfig {
            max_size: options.pool_size,
            timeouts: Timeouts {
                wait: Some(options.timeout),
                create: Some(options.timeout),
                recycle: Some(options.timeout),
            },
            ..PoolConfig::default()
        };

        let pool = match options.topology {
            Topology::Single => {
                let mut config = deadpool_redis::Config::from_url(&first);
                config.pool = Some(pool_config);
                let pool = config
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| StorageError::config(format!("redis: {e}")))?;
                Pool::Single(pool)
            }
            Topology::Sharded => {
                let mut config = deadpool_redis::cluster::Config::from_urls(options.nodes.clone());
                config.pool = Some(pool_config);
                let pool = config
                    .create_pool(Some(Runtime::Tokio1))
                    .map_err(|e| StorageError::config(format!("redis cluster: {e}")))?;
                Pool::Cluster(pool)
            }
        };

        let transport = Self {
            pool,
            pubsub_url: first,
            topology: options.topology,
        };
        transport
            .query(&redis::cmd("PING"))
            .await
            .map_err(|e| StorageError::connection(e.to_string()))?;

        info!(
            nodes = options.nodes.len(),
            topology = ?options.topology,
            "Connected to Redis"
        );
        Ok(transport)
    }
}

fn checkout_error(e: impl std::fmt::Display) -> RedisError {
    RedisError::from((
        ErrorKind::IoError,
        "connection pool checkout failed",
        e.to_string(),
    ))
}

#[async_trait]
impl Transport for RedisTransport {
    async fn query(&self, cmd: &Cmd) -> RedisResult<Value> {
        match &self.pool {
            Pool::Single(pool) => {
                let mut conn = pool.get().await.map_err(checkout_error)?;
                cmd.query_async(&mut conn).await
            }
            Pool::Cluster(pool) => {
                let mut conn = pool.get().await.map_err(checkout_error)?;
                cmd.query_async(&mut conn).await
            }
        }
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    async fn open_messages(
        &self,
        channels: &[String],
    ) -> RedisResult<BoxStream<'static, ChannelMessage>> {
        let client = redis::Client::open(self.pubsub_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(channels = ?channels, "Subscribed to channels");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(ChannelMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
