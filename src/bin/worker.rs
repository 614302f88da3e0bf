use imagegen_pipeline::{
    config::AppConfig,
    db,
    services::{
        generation::GeminiClient,
        jobs::PgJobStore,
        notify::{HttpNotifier, NoopNotifier, Notifier},
        queue::{RedisWorkQueue, WorkQueue},
        storage::S3ObjectStore,
        worker::ProcessingWorker,
    },
    telemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn describe_metrics() {
    metrics::describe_histogram!(
        "generation_seconds",
        "Time spent in the generation service per job"
    );
    metrics::describe_counter!(
        "generation_jobs_completed_total",
        "Generation jobs completed"
    );
    metrics::describe_counter!(
        "generation_jobs_failed_total",
        "Generation jobs that failed"
    );
    metrics::describe_counter!(
        "generation_notifications_failed_total",
        "Live notifications that could not be delivered"
    );
    metrics::describe_counter!(
        "generation_messages_requeued_total",
        "Unacked messages handed out again after their visibility timeout"
    );
    metrics::describe_gauge!(
        "generation_queue_depth",
        "Messages waiting in the work queue"
    );
}

/// Return messages of workers that died before acking to the pending list.
async fn requeue_expired(queue: &RedisWorkQueue) {
    match queue.requeue_expired().await {
        Ok(0) => {}
        Ok(moved) => {
            metrics::counter!("generation_messages_requeued_total").increment(moved as u64);
            tracing::warn!(moved, "Requeued messages past their visibility timeout");
        }
        Err(e) => tracing::error!(error = %e, "Failed to requeue expired messages"),
    }
}

#[tokio::main]
async fn main() {
    telemetry::init();

    tracing::info!("Starting image generation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let storage = S3ObjectStore::new(
        &config.s3_region,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
        config.s3_path_style,
    )
    .expect("Failed to initialize object storage client");

    let queue = RedisWorkQueue::new(&config.redis_url)
        .expect("Failed to initialize work queue")
        .with_visibility_timeout(Duration::from_secs(config.visibility_timeout_secs));

    let notifier: Arc<dyn Notifier> = match &config.notification_endpoint {
        Some(endpoint) => Arc::new(
            HttpNotifier::new(endpoint).expect("Failed to initialize notification client"),
        ),
        None => {
            tracing::info!("No notification endpoint configured, live notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let worker = ProcessingWorker::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(storage),
        Arc::new(GeminiClient::new(&config.gemini_api_key, &config.model_name)),
        notifier,
        config.worker_settings(),
    );

    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    tracing::info!(
        batch_size = config.worker_batch_size,
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loop"
    );

    loop {
        requeue_expired(&queue).await;

        match worker.run_once(&queue, config.worker_batch_size).await {
            Ok(Some(report)) => {
                tracing::debug!(
                    processed = report.processed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Batch handled, checking for next batch"
                );
            }
            Ok(None) => {
                tracing::trace!("No messages available, sleeping");
                if let Ok(depth) = queue.depth().await {
                    metrics::gauge!("generation_queue_depth").set(depth as f64);
                }
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to receive from work queue, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}
