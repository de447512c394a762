//! Logging setup for the runner
//!
//! Diagnostics go to stderr through `tracing`; stdout is reserved for the
//! merged test log so it can be piped or redirected on its own.
//!
//! # Example
//!
//! ```no_run
//! use conformance_runner::telemetry::init_logging;
//!
//! init_logging(false);
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is not set
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "info,conformance_runner=debug"
    } else {
        "info"
    }
}

/// Initialize logging with tracing-subscriber
///
/// RUST_LOG takes precedence over `debug`. Safe to call more than once.
pub fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
