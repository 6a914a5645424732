//! Logging bootstrap for the tenancy crates.
//!
//! The crates log through `tracing`; nothing is printed unless a subscriber
//! is installed. [`init`] installs one (feature `tracing-subscriber`) when
//! asked to through the environment:
//!
//! - `PRAX_DEBUG=true|1|yes` enables debug logging
//! - `PRAX_LOG_LEVEL=trace|debug|info|warn|error` sets the level
//! - `PRAX_LOG_FORMAT=json|pretty|compact` sets the format (default: json)
//!
//! ```rust,no_run
//! prax_tenant::logging::init();
//! ```
//!
//! Pool establishment is logged at `info` under the `prax_tenant::pool`
//! target; restore fallbacks and fail-open tenant listing at `warn`.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Crates the subscriber filter covers.
const TARGETS: &[&str] = &["prax_tenancy", "prax_tenant", "prax_tenant_postgres"];

fn debug_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn level_from(level: Option<&str>, debug: bool) -> &'static str {
    match level.map(str::to_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ if debug => "debug",
        _ => "warn",
    }
}

fn format_from(format: Option<&str>) -> &'static str {
    match format.map(str::to_lowercase).as_deref() {
        Some("pretty") => "pretty",
        Some("compact") => "compact",
        _ => "json",
    }
}

#[cfg_attr(not(feature = "tracing-subscriber"), allow(dead_code))]
fn filter_directives(level: &str) -> String {
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Check if debug logging is enabled via `PRAX_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    debug_flag(env::var("PRAX_DEBUG").ok().as_deref())
}

/// Log level from `PRAX_LOG_LEVEL`, defaulting to `debug` under `PRAX_DEBUG`
/// and `warn` otherwise.
pub fn get_log_level() -> &'static str {
    level_from(env::var("PRAX_LOG_LEVEL").ok().as_deref(), is_debug_enabled())
}

/// Log format from `PRAX_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    format_from(env::var("PRAX_LOG_FORMAT").ok().as_deref())
}

/// Install a subscriber if the environment asks for logging.
///
/// Subsequent calls are no-ops.
pub fn init() {
    if !is_debug_enabled() && env::var("PRAX_LOG_LEVEL").is_err() {
        return;
    }
    init_with_level(get_log_level());
}

/// Install a subscriber at `level`, ignoring `PRAX_DEBUG` and
/// `PRAX_LOG_LEVEL`.
pub fn init_with_level(level: &str) {
    let level = level_from(Some(level), false);
    INIT.call_once(|| install(level));
}

#[cfg(feature = "tracing-subscriber")]
fn install(level: &'static str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_new(filter_directives(level)).unwrap_or_else(|_| EnvFilter::new("warn"));
    let format = get_log_format();

    let installed = match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(level, format, "Tenancy logging initialized");
    }
}

#[cfg(not(feature = "tracing-subscriber"))]
fn install(_level: &'static str) {
    // Without the subscriber feature the application installs its own.
}
