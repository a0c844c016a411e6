//! Logging initialisation shared by RTH binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialises the global tracing subscriber from a numeric verbosity level
/// (0 = error .. 4+ = trace). An explicit `RUST_LOG` takes precedence.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
