//! Process-wide tracing setup.
//!
//! Ledger, gate and store emit `tracing` events; nothing is printed unless the
//! embedding binary installs a subscriber. The persisted audit log is separate
//! and is written regardless of `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a compact stderr subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Panics if a global subscriber is already set; use [`try_init_tracing`] when
/// that can happen.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Like [`init_tracing`], but returns `false` instead of panicking when a
/// subscriber is already installed.
pub fn try_init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}
