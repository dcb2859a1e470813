//! Tracing-subscriber initialization. JSON output in production, pretty
//! output for interactive/dev use, both driven by an env-filter so the
//! `general.log_level` config value (or `RUST_LOG`) controls verbosity.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Initialize the global tracing subscriber. Safe to call once per process;
/// a second call is a no-op (the underlying `set_global_default` error is
/// swallowed since tests may initialize repeatedly).
pub fn init(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = match format {
        LogFormat::Json => fmt().with_env_filter(filter).json().try_init(),
        LogFormat::Pretty => fmt().with_env_filter(filter).pretty().try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}
