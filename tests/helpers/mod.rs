//! Test doubles and a wired-up in-memory pipeline.

#![allow(dead_code)]

use async_trait::async_trait;
use image::ImageFormat;
use serde_json::Value;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imagegen_pipeline::{
    config::{SubmissionPolicy, WorkerSettings},
    models::job::{Job, Transition},
    models::message::{JobMessage, Notification},
    services::{
        coordinator::{SubmissionCoordinator, SubmitRequest},
        generation::{GeneratedImage, GenerationError, GenerationService},
        jobs::{JobStore, StoreError},
        memory::{MemoryJobStore, MemoryObjectStore, MemoryQuotaLedger, MemoryWorkQueue},
        notify::{NotificationError, Notifier},
        queue::{Delivery, QueueError, WorkQueue},
        storage::{ObjectRef, ObjectStore, StorageError},
        worker::ProcessingWorker,
    },
};

pub const OWNER: &str = "user-1";
pub const UPLOAD_BUCKET: &str = "uploads-bucket";
pub const RESULT_BUCKET: &str = "results-bucket";

/// A tiny valid PNG.
pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 100, 50]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// A tiny valid JPEG.
pub fn jpeg_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 120, 240]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

pub fn upload_ref(name: &str) -> ObjectRef {
    ObjectRef::new(UPLOAD_BUCKET, format!("uploads/{OWNER}/{name}"))
}

pub fn submit_request(input: &ObjectRef) -> SubmitRequest {
    SubmitRequest {
        owner_id: OWNER.to_string(),
        input_ref: input.to_string(),
        prompt: "turn this into a watercolor portrait".to_string(),
        style: "watercolor".to_string(),
        connection_id: None,
    }
}

/// Work queue whose publish always fails.
#[derive(Default)]
pub struct FailingQueue;

#[async_trait]
impl WorkQueue for FailingQueue {
    async fn publish(&self, _: &JobMessage) -> Result<String, QueueError> {
        Err(QueueError::Unavailable("broker down".to_string()))
    }

    async fn receive(&self, _: usize) -> Result<Vec<Delivery>, QueueError> {
        Ok(Vec::new())
    }

    async fn ack(&self, _: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(0)
    }
}

/// Job store whose first `n` creates fail.
pub struct FlakyJobStore {
    pub inner: Arc<MemoryJobStore>,
    failing_creates: AtomicUsize,
}

impl FlakyJobStore {
    pub fn failing_creates(n: usize) -> Self {
        Self {
            inner: Arc::new(MemoryJobStore::new()),
            failing_creates: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn transition(&self, job_id: &str, transition: &Transition) -> Result<Job, StoreError> {
        self.inner.transition(job_id, transition).await
    }

    async fn annotate_if_absent(
        &self,
        job_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        self.inner.annotate_if_absent(job_id, key, value).await
    }

    async fn list_redrivable(
        &self,
        max_attempts: u64,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_redrivable(max_attempts, limit).await
    }
}

/// Object store that counts writes on top of the in-memory store.
#[derive(Default)]
pub struct CountingObjectStore {
    pub inner: MemoryObjectStore,
    puts: AtomicUsize,
}

impl CountingObjectStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingObjectStore {
    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        self.inner.exists(object).await
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        self.inner.get(object).await
    }

    async fn put(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(object, data, content_type).await
    }
}

/// What the scripted generator does on every call.
#[derive(Clone)]
pub enum Script {
    Image,
    Jpeg,
    TextOnly,
    Unavailable,
    Slow(Duration),
}

pub struct ScriptedGenerator {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        image_png: &[u8],
    ) -> Result<GeneratedImage, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(image::guess_format(image_png).unwrap(), ImageFormat::Png);

        match &self.script {
            Script::Image => Ok(GeneratedImage {
                data: png_bytes(),
                mime_type: "image/png".to_string(),
                model: "test-model-001".to_string(),
            }),
            Script::Jpeg => Ok(GeneratedImage {
                data: jpeg_bytes(),
                mime_type: "image/jpeg".to_string(),
                model: "test-model-001".to_string(),
            }),
            Script::TextOnly => Err(GenerationError::NoImage),
            Script::Unavailable => Err(GenerationError::Unavailable("503".to_string())),
            Script::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(GeneratedImage {
                    data: png_bytes(),
                    mime_type: "image/png".to_string(),
                    model: String::new(),
                })
            }
        }
    }
}

/// Records every notification it is asked to push.
#[derive(Default)]
pub struct RecordingNotifier {
    log: Mutex<Vec<(String, Notification)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        connection_id: &str,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        self.log
            .lock()
            .unwrap()
            .push((connection_id.to_string(), notification.clone()));
        Ok(())
    }
}

/// Notifier whose target connection is always gone.
pub struct GoneNotifier;

#[async_trait]
impl Notifier for GoneNotifier {
    async fn notify(&self, connection_id: &str, _: &Notification) -> Result<(), NotificationError> {
        Err(NotificationError::Gone(connection_id.to_string()))
    }
}

/// In-memory collaborators wired into a coordinator and a worker.
pub struct Pipeline {
    pub jobs: Arc<MemoryJobStore>,
    pub quota: Arc<MemoryQuotaLedger>,
    pub storage: Arc<CountingObjectStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub generator: Arc<ScriptedGenerator>,
    pub coordinator: SubmissionCoordinator,
    pub worker: ProcessingWorker,
}

impl Pipeline {
    pub fn new(script: Script) -> Self {
        Self::with(script, SubmissionPolicy::default(), Arc::new(RecordingNotifier::default()))
    }

    pub fn with(script: Script, policy: SubmissionPolicy, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_settings(script, policy, notifier, worker_settings())
    }

    pub fn with_settings(
        script: Script,
        policy: SubmissionPolicy,
        notifier: Arc<dyn Notifier>,
        settings: WorkerSettings,
    ) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let quota = Arc::new(MemoryQuotaLedger::new());
        let storage = Arc::new(CountingObjectStore::default());
        let queue = Arc::new(MemoryWorkQueue::new());
        let generator = Arc::new(ScriptedGenerator::new(script));

        let coordinator = SubmissionCoordinator::new(
            jobs.clone(),
            quota.clone(),
            storage.clone(),
            queue.clone(),
            policy,
        );
        let worker = ProcessingWorker::new(
            jobs.clone(),
            storage.clone(),
            generator.clone(),
            notifier,
            settings,
        );

        Self {
            jobs,
            quota,
            storage,
            queue,
            generator,
            coordinator,
            worker,
        }
    }

    /// Store a valid input image under `uploads/{OWNER}/{name}`.
    pub fn upload(&self, name: &str) -> ObjectRef {
        let object = upload_ref(name);
        self.storage
            .inner
            .insert(&object, png_bytes(), "image/png");
        object
    }
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        result_bucket: RESULT_BUCKET.to_string(),
        generation_timeout: Duration::from_secs(5),
        ..WorkerSettings::default()
    }
}
