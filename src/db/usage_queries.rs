use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};

/// Atomically add one to the `(owner_id, day)` counter, creating it on
/// first use. Each write pushes the expiry horizon forward.
pub async fn increment_usage(
    pool: &PgPool,
    owner_id: &str,
    day: NaiveDate,
    expires_at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO usage_counters (owner_id, day, count, expires_at)
        VALUES ($1, $2, 1, $3)
        ON CONFLICT (owner_id, day) DO UPDATE
        SET count = usage_counters.count + 1,
            expires_at = EXCLUDED.expires_at,
            updated_at = NOW()
        RETURNING count
        "#,
    )
    .bind(owner_id)
    .bind(day)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;

    row.try_get("count")
}

/// Current count for `(owner_id, day)`, or 0 when absent or expired
pub async fn get_usage(pool: &PgPool, owner_id: &str, day: NaiveDate) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT count
        FROM usage_counters
        WHERE owner_id = $1
          AND day = $2
          AND expires_at > NOW()
        "#,
    )
    .bind(owner_id)
    .bind(day)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => r.try_get("count"),
        None => Ok(0),
    }
}

/// Delete counters past their expiry horizon
pub async fn purge_expired_usage(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM usage_counters WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
