//! In-memory collaborators.
//!
//! Non-persistent implementations of the job store, quota ledger, object
//! store and work queue, built on `DashMap` for concurrent access. They back
//! the test suite and local runs without Postgres, Redis or S3.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, Transition};
use crate::models::message::JobMessage;
use crate::services::jobs::{JobStore, StoreError};
use crate::services::queue::{Delivery, QueueError, WorkQueue, DEFAULT_VISIBILITY_TIMEOUT};
use crate::services::quota::{self, QuotaLedger};
use crate::services::redrive;
use crate::services::storage::{ObjectRef, ObjectStore, StorageError};

/// Job records keyed by job id. Transitions run under the entry's shard lock,
/// so check-and-set is atomic per job.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of every stored job.
    pub fn all(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn transition(&self, job_id: &str, transition: &Transition) -> Result<Job, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        entry
            .apply(transition, Utc::now())
            .map_err(|current| StoreError::Conflict {
                job_id: job_id.to_string(),
                current,
                requested: transition.to,
            })?;
        Ok(entry.value().clone())
    }

    async fn annotate_if_absent(
        &self,
        job_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        if entry.metadata.contains_key(key) {
            return Ok(false);
        }
        entry.metadata.insert(key.to_string(), value);
        Ok(true)
    }

    async fn list_redrivable(
        &self,
        max_attempts: u64,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| redrive::is_redrivable(entry.value(), max_attempts))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    expires_at: DateTime<Utc>,
}

impl Counter {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Usage counters keyed by `(owner, day)`, with the same expiry horizon as
/// the persistent ledger.
#[derive(Default)]
pub struct MemoryQuotaLedger {
    counters: DashMap<(String, NaiveDate), Counter>,
}

impl MemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a counter, e.g. to start an owner at their limit.
    pub fn set(&self, owner_id: &str, day: NaiveDate, count: u32) {
        self.counters.insert(
            (owner_id.to_string(), day),
            Counter {
                count,
                expires_at: quota::expires_at(Utc::now()),
            },
        );
    }

    /// Drop counters past their expiry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before - self.counters.len()
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn increment(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut entry = self
            .counters
            .entry((owner_id.to_string(), day))
            .or_insert(Counter {
                count: 0,
                expires_at: quota::expires_at(now),
            });
        if entry.is_expired(now) {
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.expires_at = quota::expires_at(now);
        Ok(entry.count)
    }

    async fn peek(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let now = Utc::now();
        Ok(self
            .counters
            .get(&(owner_id.to_string(), day))
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count)
            .unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Objects keyed by their `scheme://bucket/key` form.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: &ObjectRef, data: Vec<u8>, content_type: &str) {
        self.objects.insert(
            object.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn content_type(&self, object: &ObjectRef) -> Option<String> {
        self.objects
            .get(&object.to_string())
            .map(|stored| stored.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        Ok(self.objects.contains_key(&object.to_string()))
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(&object.to_string())
            .map(|stored| stored.data.clone())
            .ok_or_else(|| StorageError::NotFound(object.to_string()))
    }

    async fn put(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.insert(object, data.to_vec(), content_type);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    delivery: Delivery,
    deadline: Instant,
}

/// FIFO queue with an in-flight set. Received messages stay in flight until
/// acked or until their visibility timeout lapses and
/// [`WorkQueue::requeue_expired`] hands them out again.
pub struct MemoryWorkQueue {
    pending: Mutex<VecDeque<Delivery>>,
    in_flight: DashMap<String, InFlight>,
    visibility_timeout: Duration,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self {
            pending: Mutex::default(),
            in_flight: DashMap::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enqueue an arbitrary body, bypassing serialization.
    pub async fn push_raw(&self, body: &str) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.pending.lock().await.push_back(Delivery {
            message_id: message_id.clone(),
            body: body.to_string(),
            receipt: String::new(),
        });
        message_id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, message: &JobMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(message)?;
        Ok(self.push_raw(&body).await)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut pending = self.pending.lock().await;
        let take = max.min(pending.len());
        let deadline = Instant::now() + self.visibility_timeout;
        let deliveries: Vec<Delivery> = pending
            .drain(..take)
            .map(|mut delivery| {
                // Each receive gets a fresh receipt, like a transport handle.
                delivery.receipt = Uuid::new_v4().to_string();
                self.in_flight.insert(
                    delivery.receipt.clone(),
                    InFlight {
                        delivery: delivery.clone(),
                        deadline,
                    },
                );
                delivery
            })
            .collect();
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.pending.lock().await.len() as u64)
    }

    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut pending = self.pending.lock().await;
        let mut moved = 0;
        for receipt in expired {
            if let Some((_, entry)) = self.in_flight.remove(&receipt) {
                pending.push_front(entry.delivery);
                moved += 1;
            }
        }
        Ok(moved)
    }
}
