use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::PgPool;

use crate::db::usage_queries;
use crate::services::jobs::StoreError;

/// How long a day's usage counter is kept before it may be reclaimed.
pub const USAGE_RETENTION_DAYS: i64 = 90;

/// The UTC calendar day a submission is charged against.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Expiry stamped on a counter written at `now`.
pub fn expires_at(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(USAGE_RETENTION_DAYS)
}

/// Per-(owner, day) consumption counter.
///
/// No decrement exists. Quota is charged for attempted generations and is
/// never refunded, even when processing later fails.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically add one, creating the counter if needed. Returns the new count.
    async fn increment(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError>;

    /// Current count without mutating; 0 when there is no live counter.
    async fn peek(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError>;
}

/// Quota ledger backed by the `usage_counters` table.
pub struct PgQuotaLedger {
    pool: PgPool,
}

impl PgQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reclaim counters whose expiry horizon has passed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(usage_queries::purge_expired_usage(&self.pool).await?)
    }
}

fn to_count(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

#[async_trait]
impl QuotaLedger for PgQuotaLedger {
    async fn increment(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let count =
            usage_queries::increment_usage(&self.pool, owner_id, day, expires_at(Utc::now()))
                .await?;
        Ok(to_count(count))
    }

    async fn peek(&self, owner_id: &str, day: NaiveDate) -> Result<u32, StoreError> {
        Ok(to_count(usage_queries::get_usage(&self.pool, owner_id, day).await?))
    }
}
