//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `tvdatafeed=info`, or `tvdatafeed=debug` when `verbose`.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(verbose: bool) -> bool {
    let default_filter = if verbose { "tvdatafeed=debug" } else { "tvdatafeed=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
