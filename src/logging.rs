//! Tracing initialization for applications embedding rill.
//!
//! The library itself only emits `tracing` events. Each stage task runs in a
//! `stage` span carrying `pipeline`, `stage` and (for fan-out workers)
//! `worker` fields, so any subscriber can attribute events to a stage.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global fmt subscriber.
///
/// Uses the `RUST_LOG` environment variable for filtering, defaulting to `info` level.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    init_tracing_with_default("info")
}

/// Like [`init_tracing`], with a custom filter used when `RUST_LOG` is unset.
pub fn init_tracing_with_default(default_filter: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .is_ok()
}
