//! Logging for the cachelink server.
//!
//! The configured level applies to the cachelink crates and to request
//! tracing; Redis pools, hyper and reqwest stay at `warn` unless `RUST_LOG`
//! says otherwise. The level can be swapped at runtime once the config is
//! loaded.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

const SERVICE_TARGETS: [&str; 4] = [
    "cachelink",
    "cachelink_server",
    "cachelink_core",
    "cachelink_storage",
];

/// Directives that put the service crates at `level` and everything else at `warn`.
pub fn service_filter(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(SERVICE_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.push(format!("tower_http={level}"));
    directives.join(",")
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    // RUST_LOG wins over the provided level.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(service_filter(level)));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Apply the configured `logging.level`. Ignored when RUST_LOG is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let filter = service_filter(level);
        if handle.modify(|f| *f = EnvFilter::new(&filter)).is_err() {
            tracing::warn!(level, "Could not apply logging level");
        } else {
            tracing::debug!(filter = %filter, "Logging level applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_filter_scopes_level() {
        let filter = service_filter("debug");
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("cachelink_core=debug"));
        assert!(filter.contains("cachelink_storage=debug"));
        assert!(filter.contains("tower_http=debug"));
        assert!(filter.parse::<EnvFilter>().is_ok());
    }
}
