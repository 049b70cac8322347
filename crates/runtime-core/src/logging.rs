//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVES: &str = "strategy=info,checkpoint=info,collective=info,engine=info";

/// Install a global fmt subscriber filtered by `RUST_LOG` or `default_directives`
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(default_directives: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
