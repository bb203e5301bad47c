//! Tracing setup shared by binaries and tests.

use tracing::Level;

/// Install a formatting subscriber at `level`. Returns false when a global
/// subscriber is already installed.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}
