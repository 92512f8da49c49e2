//! Ambient logging. Wires `tracing_subscriber` with an `EnvFilter` and JSON
//! output, and exposes a [`TracingLogger`] implementing
//! `multibus_core::Logger` so callers that only depend on the core crate
//! can still route through the same sink.

use multibus_core::{LogLevel, Logger};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global `tracing` subscriber reading `RUST_LOG` (default
/// `info`) with JSON-formatted output. Safe to call more than once; only
/// the first call takes effect.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .try_init();
}

/// Default `Logger` implementation, routing through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) {
        let joined = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            LogLevel::Debug => tracing::debug!(%joined, "{message}"),
            LogLevel::Info => tracing::info!(%joined, "{message}"),
            LogLevel::Warn => tracing::warn!(%joined, "{message}"),
            LogLevel::Error => tracing::error!(%joined, "{message}"),
        }
    }
}
