//! Process-wide `tracing` setup for hosts embedding the engine.
//!
//! The filter sits behind a reload layer so `[logging] level` can change
//! without restarting. `RUST_LOG`, when set and parseable, wins at startup.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Installs the subscriber from the `[logging]` section.
pub fn init_tracing_from_config(logging: &LoggingConfig) -> bool {
    init_tracing_with_level(&logging.level)
}

/// Installs a registry with a reloadable filter and an `fmt` layer.
///
/// Returns `false` when a global subscriber already existed; the level is
/// then left to whoever installed it.
pub fn init_tracing_with_level(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
    }
    installed
}

/// Swaps the active filter. Returns whether a reloadable filter was in place.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = FILTER.get() else {
        return false;
    };
    match handle.reload(EnvFilter::new(level)) {
        Ok(()) => {
            tracing::info!(level, "log level changed");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "log level change failed");
            false
        }
    }
}
