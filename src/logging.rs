//! Diagnostic logging to stderr.
//!
//! Kept apart from the audit trail: audit lines are data, these are for
//! whoever operates the gateway. stdout stays free for tool output and hook
//! responses.

use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

/// Resolve the configured level name, raised by `-v` flags.
///
/// Unknown names fall back to `info`.
pub fn level_filter(configured: &str, verbose: u8) -> LevelFilter {
    let base = configured
        .trim()
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    let requested = match verbose {
        0 => LevelFilter::Off,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    base.max(requested)
}

/// Install the stderr logger. Safe to call more than once; later calls are
/// ignored.
pub fn init(configured: &str, verbose: u8) {
    let level = level_filter(configured, verbose);
    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Debug)
        .build();
    if TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto).is_err() {
        log::debug!("logger already initialised");
    }
}
