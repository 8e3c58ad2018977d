//! Structured logging setup.
//!
//! All crates log through `tracing` macros with structured fields. Binaries
//! and test harnesses call [`init_subscriber`] once; the subscriber honours
//! `RUST_LOG` and falls back to the configured level.

use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber. Only the first call has any effect.
///
/// `level` is the filter used when `RUST_LOG` is unset, e.g. `"warn"` or
/// `"commlog_cache=debug"`.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}
