//! Submission and processing against in-memory collaborators.

mod helpers;

use axum::http::StatusCode;
use futures::future::join_all;
use helpers::*;
use std::sync::Arc;
use std::time::Duration;

use imagegen_pipeline::{
    config::SubmissionPolicy,
    models::job::{meta, ErrorClass, Job, JobStatus, Transition},
    models::message::{JobMessage, Notification},
    services::{
        coordinator::{SubmissionCoordinator, SubmitError, ENQUEUE_FAILED},
        jobs::JobStore,
        memory::{MemoryJobStore, MemoryObjectStore, MemoryQuotaLedger, MemoryWorkQueue},
        queue::WorkQueue,
        quota::{self, QuotaLedger},
        redrive::{Reconciler, MAX_REDRIVE_ATTEMPTS},
        storage::{ObjectRef, ObjectStore},
        worker::output_key,
    },
};

async fn job(pipeline: &Pipeline, job_id: &str) -> Job {
    pipeline.jobs.get(job_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_submit_queues_job_and_charges_quota() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");

    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();

    assert_eq!(submission.remaining_quota, 9);
    let stored = job(&pipeline, &submission.job_id).await;
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.owner_id, OWNER);
    assert_eq!(stored.input_ref, input.to_string());
    assert!(stored.metadata.contains_key(meta::QUEUE_MESSAGE_ID));
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
    assert_eq!(pipeline.quota.peek(OWNER, quota::today()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_publish_failure_fails_job_without_charging_quota() {
    let jobs = Arc::new(MemoryJobStore::new());
    let ledger = Arc::new(MemoryQuotaLedger::new());
    let storage = Arc::new(MemoryObjectStore::new());
    let input = upload_ref("a.png");
    storage.insert(&input, png_bytes(), "image/png");

    let coordinator = SubmissionCoordinator::new(
        jobs.clone(),
        ledger.clone(),
        storage,
        Arc::new(FailingQueue),
        SubmissionPolicy::default(),
    );

    let err = coordinator.submit(submit_request(&input)).await.unwrap_err();

    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let job_id = err.job_id().expect("publish failure carries the job id");
    let stored = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some(ENQUEUE_FAILED));
    assert_eq!(stored.error_class(), Some(ErrorClass::Transient));
    assert_eq!(ledger.peek(OWNER, quota::today()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_quota_exceeded_creates_no_job() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");
    pipeline.quota.set(OWNER, quota::today(), 10);

    let err = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::QuotaExceeded { daily_limit: 10 }));
    assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert!(pipeline.jobs.is_empty());
    assert_eq!(pipeline.queue.depth().await.unwrap(), 0);
    assert_eq!(pipeline.quota.peek(OWNER, quota::today()).await.unwrap(), 10);
}

#[tokio::test]
async fn test_last_submission_of_the_day_then_rejection() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");
    pipeline.quota.set(OWNER, quota::today(), 9);

    let last = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();
    assert_eq!(last.remaining_quota, 0);

    let err = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(pipeline.jobs.len(), 1);
}

#[tokio::test]
async fn test_quota_is_per_day() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");
    let yesterday = quota::today().pred_opt().unwrap();
    pipeline.quota.set(OWNER, yesterday, 10);

    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();
    assert_eq!(submission.remaining_quota, 9);
}

#[tokio::test]
async fn test_missing_input_is_not_found() {
    let pipeline = Pipeline::new(Script::Image);
    let mut request = submit_request(&upload_ref("a.png"));
    request.input_ref = "store://bucket/missing.jpg".to_string();

    let err = pipeline.coordinator.submit(request).await.unwrap_err();

    assert!(matches!(err, SubmitError::InputNotFound(_)));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    assert!(pipeline.jobs.is_empty());
    assert_eq!(pipeline.quota.peek(OWNER, quota::today()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_prompt_validation() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");

    let mut blank = submit_request(&input);
    blank.prompt = "   ".to_string();
    let err = pipeline.coordinator.submit(blank).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    let mut long = submit_request(&input);
    long.prompt = "x".repeat(2001);
    let err = pipeline.coordinator.submit(long).await.unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    let mut bad_ref = submit_request(&input);
    bad_ref.input_ref = "not a reference".to_string();
    let err = pipeline.coordinator.submit(bad_ref).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    assert!(pipeline.jobs.is_empty());
}

#[tokio::test]
async fn test_concurrent_submissions_charge_exactly_what_was_published() {
    let policy = SubmissionPolicy {
        daily_limit: 2,
        ..SubmissionPolicy::default()
    };
    let pipeline = Pipeline::with(Script::Image, policy, Arc::new(RecordingNotifier::default()));
    let input = pipeline.upload("a.png");

    let results = join_all((0..6).map(|_| pipeline.coordinator.submit(submit_request(&input)))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();

    // The limit is soft: it may be overshot, but every charge has a published job.
    assert!(accepted >= 2);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, SubmitError::QuotaExceeded { .. })));
    assert_eq!(pipeline.jobs.len(), accepted);
    assert_eq!(pipeline.queue.depth().await.unwrap(), accepted as u64);
    assert_eq!(
        pipeline.quota.peek(OWNER, quota::today()).await.unwrap(),
        accepted as u32
    );
}

#[tokio::test]
async fn test_submitted_job_is_processed_to_completion() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");
    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();

    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let stored = job(&pipeline, &submission.job_id).await;
    let expected_output = ObjectRef::new(
        RESULT_BUCKET,
        format!("generated/{OWNER}/{}.png", submission.job_id),
    );
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.output_ref, Some(expected_output.to_string()));
    assert!(stored.metadata[meta::GENERATION_TIME].as_f64().unwrap() >= 0.0);
    assert_eq!(stored.metadata[meta::MODEL_NAME], "test-model-001");
    assert_eq!(
        stored.metadata[meta::OUTPUT_KEY],
        format!("generated/{OWNER}/{}.png", submission.job_id)
    );
    assert!(stored.updated_at >= stored.created_at);
    assert_eq!(pipeline.storage.puts(), 1);
    assert_eq!(
        pipeline.storage.inner.content_type(&expected_output).as_deref(),
        Some("image/png")
    );
}

#[tokio::test]
async fn test_redelivery_of_finished_job_is_a_no_op() {
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = Pipeline::with(Script::Image, SubmissionPolicy::default(), notifier.clone());
    let input = pipeline.upload("a.png");
    let mut request = submit_request(&input);
    request.connection_id = Some("conn-1".to_string());
    let submission = pipeline.coordinator.submit(request).await.unwrap();

    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();
    let finished = job(&pipeline, &submission.job_id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(notifier.sent().len(), 1);

    // Same message delivered again, e.g. after a visibility timeout.
    let message = JobMessage::for_job(&finished, Some("conn-1".to_string()));
    pipeline.queue.publish(&message).await.unwrap();
    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(pipeline.storage.puts(), 1);
    assert_eq!(pipeline.generator.calls(), 1);
    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(job(&pipeline, &submission.job_id).await, finished);
}

#[tokio::test]
async fn test_message_of_crashed_worker_is_redelivered_and_finished() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");
    let queue = MemoryWorkQueue::new().with_visibility_timeout(Duration::ZERO);

    let job = Job::new(OWNER, &input.to_string(), "p", "custom");
    pipeline.jobs.create(&job).await.unwrap();
    queue.publish(&JobMessage::for_job(&job, None)).await.unwrap();

    // A worker takes the message, claims the job and dies before acking.
    let lost = queue.receive(10).await.unwrap();
    assert_eq!(lost.len(), 1);
    pipeline
        .jobs
        .transition(&job.job_id, &Transition::processing())
        .await
        .unwrap();
    assert!(pipeline.worker.run_once(&queue, 10).await.unwrap().is_none());

    assert_eq!(queue.requeue_expired().await.unwrap(), 1);
    let report = pipeline.worker.run_once(&queue, 10).await.unwrap().unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(queue.in_flight(), 0);
    let finished = pipeline.jobs.get(&job.job_id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_non_png_output_is_stored_as_png() {
    let pipeline = Pipeline::new(Script::Jpeg);
    let input = pipeline.upload("a.png");
    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();
    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let finished = job(&pipeline, &submission.job_id).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let output = ObjectRef::new(RESULT_BUCKET, output_key(OWNER, &submission.job_id));
    assert_eq!(finished.output_ref.as_deref(), Some(output.to_string().as_str()));
    assert_eq!(
        pipeline.storage.inner.content_type(&output).as_deref(),
        Some("image/png")
    );
    let stored = pipeline.storage.inner.get(&output).await.unwrap();
    assert_eq!(image::guess_format(&stored).unwrap(), image::ImageFormat::Png);
}

#[tokio::test]
async fn test_malformed_message_does_not_abort_batch() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");

    let first = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();

    let orphan = Job::new(OWNER, &input.to_string(), "p", "custom");
    pipeline.jobs.create(&orphan).await.unwrap();
    let body = format!(r#"{{"jobId":"{}","ownerId":"{OWNER}","prompt":"p"}}"#, orphan.job_id);
    pipeline.queue.push_raw(&body).await;
    pipeline.queue.push_raw("not json at all").await;

    let second = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();

    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(job(&pipeline, &first.job_id).await.status, JobStatus::Completed);
    assert_eq!(job(&pipeline, &second.job_id).await.status, JobStatus::Completed);

    let orphan = job(&pipeline, &orphan.job_id).await;
    assert_eq!(orphan.status, JobStatus::Failed);
    assert!(orphan.error.as_ref().unwrap().contains("inputRef"));
    assert_eq!(orphan.error_class(), Some(ErrorClass::Permanent));
}

#[tokio::test]
async fn test_batch_is_fully_acknowledged_despite_failures() {
    let pipeline = Pipeline::new(Script::TextOnly);
    let input = pipeline.upload("a.png");
    for _ in 0..3 {
        pipeline
            .coordinator
            .submit(submit_request(&input))
            .await
            .unwrap();
    }

    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.failed, 3);
    assert_eq!(pipeline.queue.in_flight(), 0);
    assert_eq!(pipeline.queue.depth().await.unwrap(), 0);
    assert!(pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_text_only_reply_fails_job() {
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = Pipeline::with(Script::TextOnly, SubmissionPolicy::default(), notifier.clone());
    let input = pipeline.upload("a.png");
    let mut request = submit_request(&input);
    request.connection_id = Some("conn-1".to_string());
    let submission = pipeline.coordinator.submit(request).await.unwrap();

    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let stored = job(&pipeline, &submission.job_id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("no image"));
    assert_eq!(stored.error_class(), Some(ErrorClass::Permanent));
    assert!(stored.output_ref.is_none());
    assert_eq!(pipeline.storage.puts(), 0);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0].1,
        Notification::ImageFailed { job_id, status: JobStatus::Failed, .. } if *job_id == submission.job_id
    ));
    // The quota stays charged for the attempt.
    assert_eq!(pipeline.quota.peek(OWNER, quota::today()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_generation_timeout_fails_job() {
    let settings = imagegen_pipeline::config::WorkerSettings {
        generation_timeout: Duration::from_millis(50),
        ..worker_settings()
    };
    let pipeline = Pipeline::with_settings(
        Script::Slow(Duration::from_secs(5)),
        SubmissionPolicy::default(),
        Arc::new(RecordingNotifier::default()),
        settings,
    );
    let input = pipeline.upload("a.png");
    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();

    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let stored = job(&pipeline, &submission.job_id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(stored.error_class(), Some(ErrorClass::Transient));
}

#[tokio::test]
async fn test_missing_input_at_processing_time_fails_job() {
    let pipeline = Pipeline::new(Script::Image);
    let orphan = Job::new(OWNER, "s3://uploads-bucket/uploads/user-1/gone.png", "p", "custom");
    pipeline.jobs.create(&orphan).await.unwrap();
    pipeline
        .queue
        .publish(&JobMessage::for_job(&orphan, None))
        .await
        .unwrap();

    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let stored = job(&pipeline, &orphan.job_id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_class(), Some(ErrorClass::Permanent));
    assert_eq!(pipeline.generator.calls(), 0);
}

#[tokio::test]
async fn test_notification_failure_does_not_change_status() {
    let pipeline = Pipeline::with(Script::Image, SubmissionPolicy::default(), Arc::new(GoneNotifier));
    let input = pipeline.upload("a.png");
    let mut request = submit_request(&input);
    request.connection_id = Some("conn-gone".to_string());
    let submission = pipeline.coordinator.submit(request).await.unwrap();

    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(job(&pipeline, &submission.job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_worker_claims_job_not_yet_marked_queued() {
    let pipeline = Pipeline::new(Script::Image);
    let input = pipeline.upload("a.png");

    // Published, but the coordinator has not recorded `queued` yet.
    let pending = Job::new(OWNER, &input.to_string(), "p", "custom");
    pipeline.jobs.create(&pending).await.unwrap();
    pipeline
        .queue
        .publish(&JobMessage::for_job(&pending, None))
        .await
        .unwrap();

    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    assert_eq!(job(&pipeline, &pending.job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_worker_batch() {
    let settings = imagegen_pipeline::config::WorkerSettings {
        concurrency: 4,
        ..worker_settings()
    };
    let pipeline = Pipeline::with_settings(
        Script::Image,
        SubmissionPolicy::default(),
        Arc::new(RecordingNotifier::default()),
        settings,
    );
    let input = pipeline.upload("a.png");
    for _ in 0..5 {
        pipeline
            .coordinator
            .submit(submit_request(&input))
            .await
            .unwrap();
    }

    let report = pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.processed, 5);
    assert!(pipeline
        .jobs
        .all()
        .iter()
        .all(|job| job.status == JobStatus::Completed));
}

#[tokio::test]
async fn test_redrive_resubmits_transient_failures_once() {
    let pipeline = Pipeline::new(Script::Unavailable);
    let input = pipeline.upload("a.png");
    let submission = pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();
    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let failed = job(&pipeline, &submission.job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_class(), Some(ErrorClass::Transient));

    let reconciler = Reconciler::new(pipeline.jobs.clone(), pipeline.queue.clone());
    let report = reconciler.redrive(50).await.unwrap();
    assert_eq!(report.redriven, 1);

    let original = job(&pipeline, &submission.job_id).await;
    assert_eq!(original.status, JobStatus::Failed);
    let new_id = original.metadata[meta::REDRIVEN_TO].as_str().unwrap().to_string();

    let replacement = job(&pipeline, &new_id).await;
    assert_eq!(replacement.status, JobStatus::Queued);
    assert_eq!(replacement.metadata[meta::REDRIVEN_FROM], submission.job_id.as_str());
    assert_eq!(replacement.input_ref, original.input_ref);
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);

    // Not charged again, and not re-driven twice.
    assert_eq!(pipeline.quota.peek(OWNER, quota::today()).await.unwrap(), 1);
    let again = reconciler.redrive(50).await.unwrap();
    assert_eq!(again.redriven, 0);
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_redrive_leaves_permanent_failures() {
    let pipeline = Pipeline::new(Script::TextOnly);
    let input = pipeline.upload("a.png");
    pipeline
        .coordinator
        .submit(submit_request(&input))
        .await
        .unwrap();
    pipeline
        .worker
        .run_once(pipeline.queue.as_ref(), 10)
        .await
        .unwrap();

    let reconciler = Reconciler::new(pipeline.jobs.clone(), pipeline.queue.clone());
    let report = reconciler.redrive(50).await.unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(report.redriven, 0);
    assert_eq!(pipeline.jobs.len(), 1);
}

async fn store_failed(jobs: &dyn JobStore, class: ErrorClass) -> Job {
    let job = Job::new(OWNER, "s3://uploads-bucket/uploads/user-1/a.png", "p", "custom");
    jobs.create(&job).await.unwrap();
    jobs.transition(&job.job_id, &Transition::failed("boom", class))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_redrive_reaches_transient_failure_behind_newer_permanent_ones() {
    let jobs = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryWorkQueue::new());
    let transient = store_failed(jobs.as_ref(), ErrorClass::Transient).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    for _ in 0..3 {
        store_failed(jobs.as_ref(), ErrorClass::Permanent).await;
    }

    let reconciler = Reconciler::new(jobs.clone(), queue.clone());
    let report = reconciler.redrive(3).await.unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.redriven, 1);
    let original = jobs.get(&transient.job_id).await.unwrap().unwrap();
    assert!(original.metadata.contains_key(meta::REDRIVEN_TO));
    assert_eq!(queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_redrive_retries_after_replacement_create_fails() {
    let jobs = Arc::new(FlakyJobStore::failing_creates(1));
    let queue = Arc::new(MemoryWorkQueue::new());
    let original = store_failed(jobs.inner.as_ref(), ErrorClass::Transient).await;

    let reconciler = Reconciler::new(jobs.clone(), queue.clone());
    let first = reconciler.redrive(10).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.redriven, 0);

    // The original is still unclaimed, so the next pass picks it up.
    let untouched = jobs.inner.get(&original.job_id).await.unwrap().unwrap();
    assert!(!untouched.metadata.contains_key(meta::REDRIVEN_TO));

    let second = reconciler.redrive(10).await.unwrap();
    assert_eq!(second.redriven, 1);
    let claimed = jobs.inner.get(&original.job_id).await.unwrap().unwrap();
    let new_id = claimed.metadata[meta::REDRIVEN_TO].as_str().unwrap();
    let replacement = jobs.inner.get(new_id).await.unwrap().unwrap();
    assert_eq!(replacement.status, JobStatus::Queued);
    assert_eq!(replacement.metadata[meta::REDRIVE_ATTEMPT], 1);
}

#[tokio::test]
async fn test_redrive_chain_stops_at_attempt_cap() {
    let jobs = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryWorkQueue::new());
    let mut exhausted = Job::new(OWNER, "s3://uploads-bucket/uploads/user-1/a.png", "p", "custom");
    exhausted
        .metadata
        .insert(meta::REDRIVE_ATTEMPT.to_string(), MAX_REDRIVE_ATTEMPTS.into());
    jobs.create(&exhausted).await.unwrap();
    jobs.transition(
        &exhausted.job_id,
        &Transition::failed("boom", ErrorClass::Transient),
    )
    .await
    .unwrap();

    let report = Reconciler::new(jobs.clone(), queue.clone())
        .redrive(10)
        .await
        .unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(jobs.len(), 1);
}
