//! In-process backend for single-instance deployments and tests.
//!
//! Implements the command subset the cache engine needs with Redis reply
//! semantics. Every command runs under one lock, so each is atomic the way a
//! single Redis node is. Expiry is enforced lazily on access.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use glob::Pattern;
use indexmap::IndexSet;
use parking_lot::Mutex;
use redis::{Cmd, ErrorKind, RedisError, RedisResult, Value};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

use crate::scripts::BUILTIN_SCRIPTS;
use crate::transport::{ChannelMessage, Topology, Transport, split_command};

const MESSAGE_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Data {
    Str(Vec<u8>),
    Set(IndexSet<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    /// sha → builtin script name
    loaded_scripts: HashMap<String, &'static str>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn string(&mut self, key: &str) -> RedisResult<Option<Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Str(v), ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_members(&mut self, key: &str) -> RedisResult<IndexSet<Vec<u8>>> {
        match self.live(key) {
            None => Ok(IndexSet::new()),
            Some(Entry {
                data: Data::Set(s), ..
            }) => Ok(s.clone()),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &str) -> RedisResult<&mut IndexSet<Vec<u8>>> {
        if !self.exists(key) {
            self.entries
                .insert(key.to_string(), Entry::new(Data::Set(IndexSet::new())));
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                data: Data::Set(s), ..
            }) => Ok(s),
            _ => Err(wrong_type()),
        }
    }

    /// Empty sets do not exist in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        if let Some(Entry {
            data: Data::Set(s), ..
        }) = self.entries.get(key)
        {
            if s.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    fn pttl(&mut self, key: &str) -> i64 {
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
        }
    }

    fn pexpire(&mut self, key: &str, millis: i64) -> bool {
        if !self.exists(key) {
            return false;
        }
        if millis <= 0 {
            self.entries.remove(key);
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(millis as u64));
        }
        true
    }
}

/// An in-memory backend speaking a subset of the Redis command set.
pub struct LocalStore {
    keyspace: Mutex<Keyspace>,
    messages: broadcast::Sender<ChannelMessage>,
    topology: Topology,
}

impl LocalStore {
    /// A store behaving like a single Redis node.
    pub fn new() -> Self {
        Self::with_topology(Topology::Single)
    }

    /// A store that rejects every multi-key command with `CROSSSLOT`, the way
    /// a sharded cluster rejects keys spread across slots.
    pub fn sharded() -> Self {
        Self::with_topology(Topology::Sharded)
    }

    fn with_topology(topology: Topology) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            messages,
            topology,
        }
    }

    fn ensure_single_slot(&self, key_count: usize) -> RedisResult<()> {
        if self.topology == Topology::Sharded && key_count > 1 {
            return Err(RedisError::from((
                ErrorKind::CrossSlot,
                "Keys in request don't hash to the same slot",
            )));
        }
        Ok(())
    }

    fn execute(&self, name: &str, args: &[Vec<u8>]) -> RedisResult<Value> {
        let mut ks = self.keyspace.lock();
        match name {
            "GET" => {
                let [key] = args else { return Err(arity(name)) };
                Ok(ks.string(&key_of(key))?.map_or(Value::Nil, Value::BulkString))
            }
            "MGET" => {
                require_args(name, args, 1)?;
                self.ensure_single_slot(args.len())?;
                let values = args
                    .iter()
                    .map(|k| match ks.live(&key_of(k)) {
                        Some(Entry {
                            data: Data::Str(v), ..
                        }) => Value::BulkString(v.clone()),
                        _ => Value::Nil,
                    })
                    .collect();
                Ok(Value::Array(values))
            }
            "SET" => self.set(&mut ks, args),
            "DEL" => {
                require_args(name, args, 1)?;
                self.ensure_single_slot(args.len())?;
                let removed = args
                    .iter()
                    .filter(|k| {
                        let key = key_of(k);
                        let existed = ks.exists(&key);
                        ks.entries.remove(&key);
                        existed
                    })
                    .count();
                Ok(Value::Int(removed as i64))
            }
            "EXISTS" => {
                require_args(name, args, 1)?;
                self.ensure_single_slot(args.len())?;
                let found = args.iter().filter(|k| ks.exists(&key_of(k))).count();
                Ok(Value::Int(found as i64))
            }
            "SADD" => {
                require_args(name, args, 2)?;
                let set = ks.set_mut(&key_of(&args[0]))?;
                let added = args[1..].iter().filter(|m| set.insert(m.to_vec())).count();
                Ok(Value::Int(added as i64))
            }
            "SREM" => {
                require_args(name, args, 2)?;
                let key = key_of(&args[0]);
                if !ks.exists(&key) {
                    return Ok(Value::Int(0));
                }
                let set = ks.set_mut(&key)?;
                let removed = args[1..].iter().filter(|m| set.shift_remove(*m)).count();
                ks.drop_if_empty(&key);
                Ok(Value::Int(removed as i64))
            }
            "SMEMBERS" => {
                let [key] = args else { return Err(arity(name)) };
                Ok(members_reply(ks.set_members(&key_of(key))?))
            }
            "SUNION" => {
                require_args(name, args, 1)?;
                self.ensure_single_slot(args.len())?;
                let union = union_of(&mut ks, args)?;
                Ok(members_reply(union))
            }
            "SUNIONSTORE" => {
                require_args(name, args, 2)?;
                self.ensure_single_slot(args.len())?;
                let union = union_of(&mut ks, &args[1..])?;
                let dest = key_of(&args[0]);
                let count = union.len();
                ks.entries.remove(&dest);
                if count > 0 {
                    ks.entries.insert(dest, Entry::new(Data::Set(union)));
                }
                Ok(Value::Int(count as i64))
            }
            "SPOP" => {
                let [key] = args else { return Err(arity(name)) };
                let key = key_of(key);
                if !ks.exists(&key) {
                    return Ok(Value::Nil);
                }
                let popped = ks.set_mut(&key)?.pop();
                ks.drop_if_empty(&key);
                Ok(popped.map_or(Value::Nil, Value::BulkString))
            }
            "SCARD" => {
                let [key] = args else { return Err(arity(name)) };
                Ok(Value::Int(ks.set_members(&key_of(key))?.len() as i64))
            }
            "PEXPIRE" => {
                let [key, millis] = args else { return Err(arity(name)) };
                let millis = parse_int(millis)?;
                Ok(Value::Int(ks.pexpire(&key_of(key), millis) as i64))
            }
            "PTTL" => {
                let [key] = args else { return Err(arity(name)) };
                Ok(Value::Int(ks.pttl(&key_of(key))))
            }
            "KEYS" => {
                let [pattern] = args else { return Err(arity(name)) };
                let pattern = Pattern::new(&key_of(pattern)).map_err(|e| {
                    RedisError::from((ErrorKind::ResponseError, "invalid pattern", e.to_string()))
                })?;
                let now = Instant::now();
                ks.entries.retain(|_, e| !e.is_expired(now));
                let keys = ks
                    .entries
                    .keys()
                    .filter(|k| pattern.matches(k))
                    .map(|k| Value::BulkString(k.as_bytes().to_vec()))
                    .collect();
                Ok(Value::Array(keys))
            }
            "FLUSHDB" | "FLUSHALL" => {
                ks.entries.clear();
                Ok(Value::Okay)
            }
            "SCRIPT" => {
                let [sub, source] = args else { return Err(arity(name)) };
                if !sub.eq_ignore_ascii_case(b"LOAD") {
                    return Err(unknown(name));
                }
                let source = String::from_utf8_lossy(source);
                let (script, _, _) = BUILTIN_SCRIPTS
                    .iter()
                    .find(|(_, src, _)| *src == source)
                    .ok_or_else(|| {
                        RedisError::from((
                            ErrorKind::ResponseError,
                            "local backend only executes the bundled scripts",
                        ))
                    })?;
                let sha = redis::Script::new(&source).get_hash().to_string();
                ks.loaded_scripts.insert(sha.clone(), *script);
                Ok(Value::BulkString(sha.into_bytes()))
            }
            "EVALSHA" => {
                require_args(name, args, 2)?;
                let sha = key_of(&args[0]);
                let key_count = parse_int(&args[1])? as usize;
                let keys: Vec<String> = args[2..].iter().take(key_count).map(|k| key_of(k)).collect();
                self.ensure_single_slot(keys.len())?;
                let script = *ks.loaded_scripts.get(&sha).ok_or_else(|| {
                    RedisError::from((
                        ErrorKind::NoScriptError,
                        "No matching script. Please use EVAL.",
                    ))
                })?;
                run_script(&mut ks, script, &keys)
            }
            "PUBLISH" => {
                let [channel, payload] = args else { return Err(arity(name)) };
                let receivers = self
                    .messages
                    .send(ChannelMessage {
                        channel: key_of(channel),
                        payload: key_of(payload),
                    })
                    .unwrap_or(0);
                Ok(Value::Int(receivers as i64))
            }
            "PING" => Ok(Value::SimpleString("PONG".into())),
            _ => Err(unknown(name)),
        }
    }

    fn set(&self, ks: &mut Keyspace, args: &[Vec<u8>]) -> RedisResult<Value> {
        require_args("SET", args, 2)?;
        let key = key_of(&args[0]);
        let mut ttl = None;
        let mut nx = false;
        let mut xx = false;
        let mut options = args[2..].iter();
        while let Some(option) = options.next() {
            match String::from_utf8_lossy(option).to_ascii_uppercase().as_str() {
                "NX" => nx = true,
                "XX" => xx = true,
                "PX" => {
                    let millis = parse_int(options.next().ok_or_else(|| arity("SET"))?)?;
                    ttl = Some(positive_duration(millis)?);
                }
                "EX" => {
                    let secs = parse_int(options.next().ok_or_else(|| arity("SET"))?)?;
                    ttl = Some(positive_duration(secs.saturating_mul(1000))?);
                }
                _ => return Err(RedisError::from((ErrorKind::ResponseError, "syntax error"))),
            }
        }

        let exists = ks.exists(&key);
        if (nx && exists) || (xx && !exists) {
            return Ok(Value::Nil);
        }
        ks.entries.insert(
            key,
            Entry {
                data: Data::Str(args[1].clone()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(Value::Okay)
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn run_script(ks: &mut Keyspace, script: &str, keys: &[String]) -> RedisResult<Value> {
    match script {
        "pexpiremax" => {
            let max = keys.iter().map(|k| ks.pttl(k)).fold(-2, i64::max);
            if max > 0 {
                if let Some(first) = keys.first() {
                    ks.pexpire(first, max);
                }
            }
            Ok(Value::Int(max))
        }
        "smoveall" => {
            let [source, dest] = keys else {
                return Err(arity("EVALSHA"));
            };
            let members = ks.set_members(source)?;
            let moved = members.len();
            if moved > 0 {
                ks.set_mut(dest)?.extend(members);
            }
            ks.entries.remove(source);
            Ok(Value::Int(moved as i64))
        }
        _ => Err(unknown(script)),
    }
}

fn union_of(ks: &mut Keyspace, keys: &[Vec<u8>]) -> RedisResult<IndexSet<Vec<u8>>> {
    let mut union = IndexSet::new();
    for key in keys {
        union.extend(ks.set_members(&key_of(key))?);
    }
    Ok(union)
}

fn members_reply(members: IndexSet<Vec<u8>>) -> Value {
    Value::Array(members.into_iter().map(Value::BulkString).collect())
}

fn key_of(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn parse_int(raw: &[u8]) -> RedisResult<i64> {
    String::from_utf8_lossy(raw).parse().map_err(|_| {
        RedisError::from((
            ErrorKind::ResponseError,
            "value is not an integer or out of range",
        ))
    })
}

fn positive_duration(millis: i64) -> RedisResult<Duration> {
    if millis <= 0 {
        return Err(RedisError::from((
            ErrorKind::ResponseError,
            "invalid expire time in 'set' command",
        )));
    }
    Ok(Duration::from_millis(millis as u64))
}

fn require_args(name: &str, args: &[Vec<u8>], min: usize) -> RedisResult<()> {
    if args.len() < min {
        return Err(arity(name));
    }
    Ok(())
}

fn arity(name: &str) -> RedisError {
    RedisError::from((
        ErrorKind::ResponseError,
        "wrong number of arguments",
        name.to_string(),
    ))
}

fn unknown(name: &str) -> RedisError {
    RedisError::from((ErrorKind::ResponseError, "unknown command", name.to_string()))
}

fn wrong_type() -> RedisError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ))
}

#[async_trait]
impl Transport for LocalStore {
    async fn query(&self, cmd: &Cmd) -> RedisResult<Value> {
        let (name, args) = split_command(cmd);
        self.execute(&name, &args)
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    async fn open_messages(
        &self,
        channels: &[String],
    ) -> RedisResult<BoxStream<'static, ChannelMessage>> {
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let receiver = self.messages.subscribe();
        let stream = stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "local pub/sub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |m| std::future::ready(wanted.contains(&m.channel)));
        Ok(stream.boxed())
    }
}
