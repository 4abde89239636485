//! Gradewise Background Worker
//!
//! Handles scheduled jobs including:
//! - Monthly credit rollover (1st of the month, 00:05 UTC)
//! - Monthly usage period reset (1st of the month, 00:00 UTC)
//! - Billing invariant checks (daily at 02:30 UTC)

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use gradewise_billing::{PgBillingStore, SharedStore};
use gradewise_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::jobs::BillingJobs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gradewise Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let store: SharedStore = Arc::new(PgBillingStore::new(pool));
    let jobs = BillingJobs::new(store);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Usage period reset
    // Cron: At 00:00 UTC on the 1st of every month
    let reset_jobs = jobs.clone();
    scheduler
        .add(Job::new_async("0 0 0 1 * *", move |_uuid, _l| {
            let jobs = reset_jobs.clone();
            Box::pin(async move {
                info!("Running monthly usage period reset");
                if let Err(e) = jobs.reset_usage_periods().await {
                    error!(error = %e, "Usage period reset aborted");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage period reset (monthly)");

    // Job 2: Credit rollover
    // Cron: At 00:05 UTC on the 1st of every month
    let rollover_jobs = jobs.clone();
    scheduler
        .add(Job::new_async("0 5 0 1 * *", move |_uuid, _l| {
            let jobs = rollover_jobs.clone();
            Box::pin(async move {
                info!("Running monthly credit rollover");
                if let Err(e) = jobs.rollover_credits().await {
                    error!(error = %e, "Credit rollover aborted");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Credit rollover (monthly)");

    // Job 3: Invariant checks
    let invariant_jobs = jobs.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let jobs = invariant_jobs.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                if let Err(e) = jobs.check_invariants().await {
                    error!(error = %e, "Billing invariant checks aborted");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 02:30 UTC)");

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Gradewise Worker started with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
