use std::sync::Arc;

use clap::Parser;
use tracing::info;

use referral_ledger::config::{configure_sqlite_pool, Env};
use referral_ledger::directory::HttpMemberDirectory;
use referral_ledger::rewards::{PayoutChannels, RewardLedger};
use referral_ledger::sweeper::RewardSweeper;
use referral_ledger::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = Env::parse().into_ctx()?;
    telemetry::init(ctx.log_level.into());

    let pool = configure_sqlite_pool(&ctx.database_url).await?;
    sqlx::migrate!().run(&pool).await?;

    let directory = Arc::new(HttpMemberDirectory::new(
        ctx.directory.base_url.clone(),
        ctx.directory.api_token.clone(),
    ));
    let rewards = Arc::new(RewardLedger::new(
        pool,
        ctx.channels,
        PayoutChannels::production(directory),
    ));
    let sweeper = RewardSweeper::new(ctx.sweeper, rewards);

    tokio::select! {
        () = sweeper.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
