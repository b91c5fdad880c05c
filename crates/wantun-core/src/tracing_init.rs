//! Shared tracing/logging initialization.
//!
//! The daemon sets up `tracing_subscriber` once at startup; the default
//! filter is derived from the `--debug` flag and can be overridden with
//! the `RUST_LOG` environment variable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not
///   set (e.g. `"wantun_daemon=info"`).
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
