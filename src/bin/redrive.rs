//! One re-drive pass: reclaim expired usage counters, then resubmit failed
//! jobs whose error class is transient. Intended to run from a scheduler.

use imagegen_pipeline::{
    config::AppConfig,
    db,
    services::{
        jobs::PgJobStore, queue::RedisWorkQueue, quota::PgQuotaLedger, redrive::Reconciler,
    },
    telemetry,
};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    match PgQuotaLedger::new(db_pool.clone()).purge_expired().await {
        Ok(purged) => tracing::info!(purged, "Expired usage counters reclaimed"),
        Err(e) => tracing::warn!(error = %e, "Failed to purge expired usage counters"),
    }

    let queue = RedisWorkQueue::new(&config.redis_url).expect("Failed to initialize work queue");
    let reconciler = Reconciler::new(Arc::new(PgJobStore::new(db_pool)), Arc::new(queue));

    match reconciler.redrive(config.redrive_batch_size).await {
        Ok(report) => {
            tracing::info!(
                examined = report.examined,
                redriven = report.redriven,
                failed = report.failed,
                "Re-drive finished"
            );
            if report.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Re-drive pass aborted");
            ExitCode::FAILURE
        }
    }
}
