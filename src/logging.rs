//! Tracing subscriber setup.

use crate::config::EnvConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive: `LAB_DEBUG` forces `debug`, otherwise
/// `LAB_LOG_LEVEL` applies to this crate and `warn` to dependencies.
pub fn default_directive(env: &EnvConfig) -> String {
    let level = if env.debug {
        "debug"
    } else {
        env.log_level.trim()
    };
    let level = if level.is_empty() { "info" } else { level };
    format!("warn,proxy_lab={level}")
}

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// directive when set. Calling this twice is a no-op.
pub fn init_logging(env: &EnvConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(env)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
