//! Logging setup for colony.
//!
//! Library code logs through `tracing` macros. The binary installs a
//! subscriber here:
//! - ERROR: escalations and unrecoverable worker failures
//! - WARN: recoverable anomalies (stale reports, retries, timeouts)
//! - INFO: lifecycle (assignments, completions, spawns, scaling)
//! - DEBUG: scheduling decisions and health evaluations
//! - TRACE: per-worker probe results
//!
//! Debug mode can be enabled with `--debug` or `COLONY_DEBUG=1`. A
//! `COLONY_LOG` env var holding an `EnvFilter` directive overrides both.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Env var that turns on debug logging.
pub const DEBUG_ENV: &str = "COLONY_DEBUG";
/// Env var holding an explicit filter directive.
pub const FILTER_ENV: &str = "COLONY_LOG";

/// Initialize logging to `~/.colony/colony.log`.
///
/// The log file is truncated on startup. If it cannot be opened, logs go
/// to stderr. Calling this twice is harmless.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = std::env::var(FILTER_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = Config::log_path().ok().and_then(|path| {
        std::fs::create_dir_all(path.parent()?).ok()?;
        File::create(path).ok()
    });

    let _ = match log_file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "colony=debug,info"
    } else {
        "colony=info,warn"
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
