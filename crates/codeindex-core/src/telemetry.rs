use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the process-wide tracing subscriber. `RUST_LOG` wins over the
/// configured level; repeated calls (common in tests) are ignored.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
