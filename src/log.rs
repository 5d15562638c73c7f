//! Structured logging for weir.
//!
//! Log levels:
//! - ERROR: failures that halt the run (graph errors, state I/O)
//! - WARN: contained failures (task attempts, gates, hook observers)
//! - INFO: run, level and merge milestones
//! - DEBUG: claims, heartbeats, git operations
//!
//! The filter comes from `WEIR_LOG` when set. Otherwise debug mode
//! (`--debug` or `WEIR_DEBUG=1`) selects `debug` and everything else `info`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::Result;

pub const LOG_FILE: &str = "weir.log";

/// Whether debug logging was requested through the environment.
pub fn debug_from_env() -> bool {
    std::env::var("WEIR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter(debug: bool) -> EnvFilter {
    match std::env::var("WEIR_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ if debug => EnvFilter::new("debug"),
        _ => EnvFilter::new("info"),
    }
}

/// Install the global subscriber writing to `<dir>/weir.log`.
///
/// The file is truncated on each start. Returns the log path.
pub fn init(dir: &Path, debug: bool) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;

    let debug = debug || debug_from_env();
    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(filter(debug))
        .try_init();

    let debug_enabled = debug;
    info!(path = %path.display(), debug = debug_enabled, "logging initialized");
    Ok(path)
}
