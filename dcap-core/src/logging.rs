//! Tracing subscriber setup. Verbosity comes from `DCACHE_DEBUG`
//! (an `EnvFilter` directive such as `debug` or `dcap_core::poll=trace`).

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "DCACHE_DEBUG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(DEBUG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a global fmt subscriber. Later calls (or a host that already
/// installed its own subscriber) leave the existing one in place.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Subscriber that writes through the test harness capture.
#[cfg(test)]
pub(crate) fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init();
}
