//! Diagnostic output through `tracing`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "hoist=info";
/// Filter used when `RUST_LOG` is unset and `-v` was given.
pub const VERBOSE_FILTER: &str = "hoist=debug";

/// Builds the event filter: `RUST_LOG` wins, otherwise the verbosity picks a
/// default.
#[must_use]
pub fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_FILTER
        } else {
            DEFAULT_FILTER
        })
    })
}

/// Installs a stderr subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let installed = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
