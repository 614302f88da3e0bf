use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::job::{Job, JobStatus, Transition};

const JOB_COLUMNS: &str = "job_id, owner_id, status, input_ref, output_ref, prompt, style, \
                           error, metadata, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let metadata = match row.try_get::<Value, _>("metadata")? {
        Value::Object(map) => map,
        _ => Default::default(),
    };

    Ok(Job {
        job_id: row.try_get("job_id")?,
        owner_id: row.try_get("owner_id")?,
        status,
        input_ref: row.try_get("input_ref")?,
        output_ref: row.try_get("output_ref")?,
        prompt: row.try_get("prompt")?,
        style: row.try_get("style")?,
        error: row.try_get("error")?,
        metadata,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job record
pub async fn create_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO generation_jobs
            (job_id, owner_id, status, input_ref, output_ref, prompt, style,
             error, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.owner_id)
    .bind(job.status.to_string())
    .bind(&job.input_ref)
    .bind(&job.output_ref)
    .bind(&job.prompt)
    .bind(&job.style)
    .bind(&job.error)
    .bind(Value::Object(job.metadata.clone()))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Apply a transition if, and only if, the job is currently in one of the
/// transition's allowed predecessor states.
///
/// Returns `None` when the row is missing or the condition did not hold.
pub async fn transition_job(
    pool: &PgPool,
    job_id: &str,
    transition: &Transition,
) -> Result<Option<Job>, sqlx::Error> {
    let allowed: Vec<String> = transition
        .to
        .predecessors()
        .iter()
        .map(ToString::to_string)
        .collect();

    let row = sqlx::query(&format!(
        r#"
        UPDATE generation_jobs
        SET status = $2,
            output_ref = COALESCE($3, output_ref),
            error = COALESCE($4, error),
            metadata = metadata || $5,
            updated_at = NOW()
        WHERE job_id = $1
          AND status = ANY($6)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(transition.to.to_string())
    .bind(&transition.output_ref)
    .bind(&transition.error)
    .bind(Value::Object(transition.metadata.clone()))
    .bind(allowed)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Add a metadata key unless it is already present. Returns whether the
/// key was written.
pub async fn annotate_job_if_absent(
    pool: &PgPool,
    job_id: &str,
    key: &str,
    value: Value,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET metadata = metadata || jsonb_build_object($2::text, $3::jsonb)
        WHERE job_id = $1
          AND NOT jsonb_exists(metadata, $2)
        "#,
    )
    .bind(job_id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Failed transient jobs not yet re-driven and under the attempt cap,
/// oldest failure first
pub async fn list_redrivable_jobs(
    pool: &PgPool,
    max_attempts: i64,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM generation_jobs
        WHERE status = 'failed'
          AND metadata->>'errorClass' = 'transient'
          AND NOT jsonb_exists(metadata, 'redrivenTo')
          AND COALESCE((metadata->>'redriveAttempt')::bigint, 0) < $1
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    ))
    .bind(max_attempts)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
