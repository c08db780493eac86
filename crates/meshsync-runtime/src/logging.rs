//! Logging setup
//!
//! Installs a plain `tracing_subscriber` formatter. Library code only emits
//! through `tracing` macros; binaries and tests choose the subscriber.

use anyhow::anyhow;

fn level(verbose: bool) -> tracing::Level {
    if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

/// Setup logging based on verbosity level
///
/// Panics if a global subscriber is already installed; use
/// [`try_setup_logging`] where that can happen.
pub fn setup_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(level(verbose))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Like [`setup_logging`] but reports an already-installed subscriber
pub fn try_setup_logging(verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level(verbose))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_test_writer()
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
