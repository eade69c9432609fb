//! Console logging setup. `RUST_LOG` overrides the configured default
//! level when set, so operators can raise verbosity without touching
//! the config file.

use tracing::Level;
use tracing_subscriber::EnvFilter;

pub fn init(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("referral_ledger={default_level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
