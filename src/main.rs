use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use imagegen_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        coordinator::SubmissionCoordinator, jobs::PgJobStore, queue::RedisWorkQueue,
        quota::PgQuotaLedger, storage::S3ObjectStore,
    },
    telemetry,
};

fn describe_metrics() {
    metrics::describe_counter!(
        "generation_jobs_submitted_total",
        "Generation jobs accepted and queued"
    );
    metrics::describe_counter!(
        "generation_jobs_rejected_total",
        "Submissions rejected, labelled by reason"
    );
    metrics::describe_counter!(
        "generation_quota_commit_failures_total",
        "Published jobs whose quota increment failed"
    );
}

#[tokio::main]
async fn main() {
    telemetry::init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing imagegen-pipeline API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing object storage client");
    let storage = S3ObjectStore::new(
        &config.s3_region,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
        config.s3_path_style,
    )
    .expect("Failed to initialize object storage client");

    tracing::info!("Connecting to Redis work queue");
    let queue = Arc::new(RedisWorkQueue::new(&config.redis_url).expect("Failed to initialize work queue"));

    let jobs = Arc::new(PgJobStore::new(db_pool.clone()));
    let coordinator = SubmissionCoordinator::new(
        jobs.clone(),
        Arc::new(PgQuotaLedger::new(db_pool)),
        Arc::new(storage),
        queue.clone(),
        config.submission_policy(),
    );

    let state = AppState::new(jobs, queue, coordinator, &config.upload_bucket);

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .merge(
            Router::new().route(
                "/metrics",
                get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
            ),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    tracing::info!("Starting imagegen-pipeline on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
