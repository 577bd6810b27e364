//! Server-side Lua scripts executed atomically by content hash.
//!
//! Each script ships with a JSON descriptor declaring how the caller's
//! arguments split into `KEYS` and `ARGV`: either a fixed number of keys
//! (`keysCount`) or a number of trailing non-key arguments (`argsCount`).

use std::collections::HashMap;

use serde::Deserialize;
use tracing::info;

use crate::error::StorageError;

/// Script sources bundled with the crate: `(name, source, descriptor)`.
pub(crate) const BUILTIN_SCRIPTS: &[(&str, &str, &str)] = &[
    (
        "pexpiremax",
        include_str!("../scripts/pexpiremax.lua"),
        include_str!("../scripts/pexpiremax.json"),
    ),
    (
        "smoveall",
        include_str!("../scripts/smoveall.lua"),
        include_str!("../scripts/smoveall.json"),
    ),
];

/// How many of a script's arguments are keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCount {
    /// Exactly this many leading arguments are keys.
    Fixed(usize),
    /// All arguments except this many trailing ones are keys.
    AllBut(usize),
}

impl KeyCount {
    /// Number of keys for a call with `arg_count` arguments.
    pub fn resolve(self, arg_count: usize) -> usize {
        match self {
            KeyCount::Fixed(n) => n,
            KeyCount::AllBut(n) => arg_count.saturating_sub(n),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptDescriptor {
    keys_count: Option<usize>,
    args_count: Option<usize>,
}

/// A registered script.
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub name: String,
    pub source: String,
    /// SHA-1 hex digest of `source`, as used by `EVALSHA`.
    pub hash: String,
    pub key_count: KeyCount,
}

impl ScriptInfo {
    fn from_parts(name: &str, source: &str, descriptor: &str) -> Result<Self, StorageError> {
        let descriptor: ScriptDescriptor = serde_json::from_str(descriptor).map_err(|e| {
            StorageError::config(format!("scripts: invalid descriptor {name}.json: {e}"))
        })?;

        let key_count = match (descriptor.keys_count, descriptor.args_count) {
            (Some(keys), _) => KeyCount::Fixed(keys),
            (None, Some(args)) => KeyCount::AllBut(args),
            (None, None) => {
                return Err(StorageError::config(format!(
                    "scripts: config {name}.json missing \"keysCount\" or \"argsCount\" property"
                )));
            }
        };

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            hash: redis::Script::new(source).get_hash().to_string(),
            key_count,
        })
    }
}

/// Name → script lookup, built once per adapter.
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, ScriptInfo>,
}

impl ScriptRegistry {
    /// Builds the registry from the bundled scripts.
    pub fn builtin() -> Result<Self, StorageError> {
        Self::from_sources(BUILTIN_SCRIPTS.iter().copied())
    }

    /// Builds a registry from `(name, source, descriptor)` triples.
    pub fn from_sources<'a>(
        sources: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    ) -> Result<Self, StorageError> {
        let mut scripts = HashMap::new();
        for (name, source, descriptor) in sources {
            let info = ScriptInfo::from_parts(name, source, descriptor)?;
            info!(script = %info.name, hash = %info.hash, "scripts: loaded");
            scripts.insert(name.to_ascii_uppercase(), info);
        }
        Ok(Self { scripts })
    }

    /// Looks up a script by command name (case-insensitive).
    pub fn get(&self, command: &str) -> Option<&ScriptInfo> {
        self.scripts.get(&command.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}
