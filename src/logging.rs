//! Log initialization from the `LOGLEVEL` environment variable.
//!
//! The shim is injected into arbitrary programs, so it cannot assume the
//! host configured a logger; it installs its own `env_logger` backend, with
//! the level names the measurement scripts historically used
//! (`DEBUG`/`INFO`/`WARNING`/`ERROR`) rather than `RUST_LOG` syntax.

use log::LevelFilter;

/// Install the global logger. Safe to call more than once; later calls are
/// ignored.
pub fn init() {
    let level = std::env::var("LOGLEVEL")
        .map(|v| level_from(&v))
        .unwrap_or(LevelFilter::Error);

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_secs()
        .try_init();
}

fn level_from(name: &str) -> LevelFilter {
    match name {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => LevelFilter::Error,
    }
}
