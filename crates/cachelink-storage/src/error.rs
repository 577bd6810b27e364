//! Error types for the storage adapter.
//!
//! Every fault raised by the adapter carries enough context (command name and
//! arguments, or the script name) to be logged and surfaced to callers.

use std::fmt;

use redis::RedisError;

/// Errors that can occur while talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No connection could be checked out of the pool.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// The backend rejected a command or the transport failed mid-command.
    #[error("Backend error executing \"{command}\": {source}")]
    Backend {
        /// The command that failed.
        command: String,
        /// The arguments that were sent with it, rendered for logging.
        args: Vec<String>,
        /// The underlying client error.
        #[source]
        source: RedisError,
    },

    /// A server-side script could not be installed after a `NOSCRIPT` miss.
    #[error("Could not load script \"{script}\": {source}")]
    ScriptLoad {
        /// Name of the script that failed to load.
        script: String,
        /// The underlying client error.
        #[source]
        source: RedisError,
    },

    /// Invalid adapter configuration (bad node list, bad script descriptor).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A published message could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(command: impl Into<String>, args: Vec<String>, source: RedisError) -> Self {
        Self::Backend {
            command: command.into(),
            args,
            source,
        }
    }

    /// Creates a new `ScriptLoad` error.
    #[must_use]
    pub fn script_load(script: impl Into<String>, source: RedisError) -> Self {
        Self::ScriptLoad {
            script: script.into(),
            source,
        }
    }

    /// Creates a new `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns `true` if the backend reported a missing server-side script.
    #[must_use]
    pub fn is_no_script(&self) -> bool {
        matches!(self, Self::Backend { source, .. } if source.kind() == redis::ErrorKind::NoScriptError)
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Infrastructure,
            Self::Backend { .. } => ErrorCategory::Backend,
            Self::ScriptLoad { .. } => ErrorCategory::Script,
            Self::Config { .. } => ErrorCategory::Config,
            Self::Serialization(_) => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Pool or connection failure.
    Infrastructure,
    /// Command rejected by the backend.
    Backend,
    /// Server-side script installation failure.
    Script,
    /// Adapter misconfiguration.
    Config,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Backend => write!(f, "backend"),
            Self::Script => write!(f, "script"),
            Self::Config => write!(f, "config"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
