//! Tracing subscriber setup for daemon use.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `SPINDLE_LOG` overrides the default filter. `json` switches to
/// machine-readable output for log shippers. Safe to call once per
/// process; subsequent calls are no-ops.
pub fn init_logging(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_env("SPINDLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // Already initialized (tests, embedders): keep the existing one.
    drop(result);
}
