use std::io;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the stderr logger. `RUST_LOG` overrides the default filter, which
/// is `info` (or `debug` for this crate when `verbose` is set).
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "info,dropbox_backup=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console = fmt::layer()
        .with_writer(io::stderr)
        .without_time()
        .with_target(false)
        .with_level(true);

    // A subscriber may already be installed when running under a test harness.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init();
}
