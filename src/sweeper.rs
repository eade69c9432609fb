//! Time-driven reward sweep: periodically asks the reward ledger to
//! pay out every due reward. A cycle failure is logged and the loop
//! keeps running; per-reward failures are already absorbed inside the
//! ledger.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{interval, Interval};
use tracing::{error, info};

use crate::rewards::RewardLedger;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_jitter: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            // Daily in the current deployment.
            interval: Duration::from_secs(24 * 60 * 60),
            max_jitter: Duration::from_secs(60),
        }
    }
}

pub struct RewardSweeper {
    config: SweeperConfig,
    ledger: Arc<RewardLedger>,
    interval: Interval,
}

impl RewardSweeper {
    pub fn new(config: SweeperConfig, ledger: Arc<RewardLedger>) -> Self {
        let interval = interval(config.interval);

        Self {
            config,
            ledger,
            interval,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Starting reward sweeper with interval: {:?}",
            self.config.interval
        );

        loop {
            self.interval.tick().await;
            self.add_jittered_delay().await;

            match self.ledger.process_due_rewards().await {
                Ok(summary) => info!(
                    "Reward sweep finished: {} paid, {} failed, {} skipped, {} stuck",
                    summary.paid, summary.failed, summary.skipped, summary.stuck
                ),
                Err(e) => error!("Reward sweep failed: {e}"),
            }
        }
    }

    /// Spreads overlapping deployments out so their sweeps do not all
    /// hit the store at the same instant.
    async fn add_jittered_delay(&self) {
        let max_jitter_millis = self.config.max_jitter.as_millis();
        if max_jitter_millis > 0 {
            let jitter_millis = rand::thread_rng().gen_range(0..max_jitter_millis);
            let jitter = Duration::from_millis(jitter_millis.try_into().unwrap_or(u64::MAX));
            tokio::time::sleep(jitter).await;
        }
    }
}
