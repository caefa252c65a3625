//! Tracing setup for binaries and tests. Filtering follows the `RUST_LOG` environment variable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global `fmt` subscriber. Returns false if a global subscriber is already installed, which makes it safe
/// to call from every test.
pub fn init_tracing() -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rx_store=info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Tracing initialized");
    }
    installed
}
