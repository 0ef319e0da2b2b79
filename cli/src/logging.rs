use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

fn default_log_level() -> &'static str {
    "info"
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
///
/// Logs go to stderr; stdout carries the JSON reports.
pub fn init_logging() {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level()));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    });
}
