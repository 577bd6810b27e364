//! The seam between the adapter and a concrete backend.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use redis::{Arg, Cmd, RedisResult, Value};

/// Whether the backend is one node or a sharded cluster.
///
/// Multi-key primitives are only emulated client-side for [`Topology::Sharded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Single,
    Sharded,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Executes raw commands against one backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Execute a single command and return the raw reply.
    async fn query(&self, cmd: &Cmd) -> RedisResult<Value>;

    /// The backend layout behind this transport.
    fn topology(&self) -> Topology;

    /// Open one subscriber connection listening on `channels`.
    ///
    /// The returned stream ends when the connection is lost.
    async fn open_messages(
        &self,
        channels: &[String],
    ) -> RedisResult<BoxStream<'static, ChannelMessage>>;
}

/// Splits a command into its name (upper-cased) and its raw arguments.
pub fn split_command(cmd: &Cmd) -> (String, Vec<Vec<u8>>) {
    let mut parts = cmd.args_iter().filter_map(|arg| match arg {
        Arg::Simple(bytes) => Some(bytes.to_vec()),
        Arg::Cursor => None,
    });
    let name = parts
        .next()
        .map(|n| String::from_utf8_lossy(&n).to_ascii_uppercase())
        .unwrap_or_default();
    (name, parts.collect())
}

/// Renders raw arguments for log lines and error context.
pub fn printable_args(args: &[Vec<u8>]) -> Vec<String> {
    args.iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        let mut cmd = redis::cmd("sadd");
        cmd.arg("c:foo").arg(vec!["a", "b"]);
        let (name, args) = split_command(&cmd);
        assert_eq!(name, "SADD");
        assert_eq!(printable_args(&args), vec!["c:foo", "a", "b"]);
    }

    #[test]
    fn test_split_empty_command() {
        let cmd = Cmd::new();
        let (name, args) = split_command(&cmd);
        assert!(name.is_empty());
        assert!(args.is_empty());
    }
}
