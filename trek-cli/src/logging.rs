//! Logging setup for the trek binary.
//!
//! Library code logs through `tracing`; this module installs the subscriber.
//! Output goes to stderr so `generate --stdout` stays clean.
//!
//! # Environment Variables
//!
//! - `TREK_DEBUG=true|1|yes` - Enable debug logging
//! - `TREK_LOG_LEVEL=trace|debug|info|warn|error` - Set the level (default: info)
//! - `TREK_LOG_FORMAT=json|pretty|compact` - Set the format (default: compact)

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Check if debug logging is enabled via `TREK_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("TREK_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Resolve the log level from `TREK_LOG_LEVEL` and `TREK_DEBUG`.
pub fn log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "info" };
    match env::var("TREK_LOG_LEVEL") {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// Resolve the log format from `TREK_LOG_FORMAT`.
pub fn log_format() -> &'static str {
    env::var("TREK_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "json" => "json",
            "pretty" => "pretty",
            _ => "compact",
        })
        .unwrap_or("compact")
}

/// Install the global subscriber. Subsequent calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let level = log_level();
        let filter = EnvFilter::try_new(format!(
            "trek={},trek_migrate={},trek_cli={}",
            level, level, level
        ))
        .unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);
        let result = match log_format() {
            "json" => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            "pretty" => registry
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
            _ => registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init(),
        };

        if result.is_ok() {
            tracing::debug!(level, format = log_format(), "Logging initialized");
        }
    });
}
