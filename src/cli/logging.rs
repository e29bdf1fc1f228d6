//! Logging initialization

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` with the debug
/// flag and `info` without. Stdout is left alone so `netcheck run` can write
/// its output document there.
pub fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(debug)
        .with_file(debug)
        .with_line_number(debug)
        .init();
}

/// Initialize logging for the probe CLI.
///
/// Probe pods share one log stream for stdout and stderr, so only warnings
/// are emitted unless `verbose` is set.
pub fn init_probe_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_ansi(false)
        .with_target(false)
        .init();
}
