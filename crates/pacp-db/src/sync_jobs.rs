use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use pacp_schemas::{ids, new_id, OperationStatus, SyncJob, SyncType, TriggeredBy};

#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub upstream_instance_id: String,
    pub sync_type: SyncType,
    pub triggered_by: TriggeredBy,
    pub created_by: Option<String>,
}

fn row_to_sync_job(row: sqlx::postgres::PgRow) -> Result<SyncJob> {
    let sync_type_str: String = row.try_get("sync_type")?;
    let triggered_by_str: String = row.try_get("triggered_by")?;
    let status_str: String = row.try_get("status")?;

    Ok(SyncJob {
        id: row.try_get("id")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        sync_type: SyncType::parse(&sync_type_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt sync_type: {sync_type_str}"))?,
        triggered_by: match triggered_by_str.as_str() {
            "manual" => TriggeredBy::Manual,
            "scheduled" => TriggeredBy::Scheduled,
            other => return Err(anyhow::anyhow!("corrupt triggered_by: {other}")),
        },
        status: OperationStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt status: {status_str}"))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        records_synced: row.try_get("records_synced")?,
        error_message: row.try_get("error_message")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn create_sync_job(pool: &PgPool, new: NewSyncJob) -> Result<SyncJob> {
    let id = new_id(ids::SYNC_JOB_PREFIX);
    let row = sqlx::query(
        r#"
        insert into sync_jobs
            (id, upstream_instance_id, sync_type, triggered_by, status, created_by)
        values ($1, $2, $3, $4, 'pending', $5)
        returning *
        "#,
    )
    .bind(&id)
    .bind(&new.upstream_instance_id)
    .bind(new.sync_type.as_str())
    .bind(new.triggered_by.as_str())
    .bind(&new.created_by)
    .fetch_one(pool)
    .await
    .context("create_sync_job insert failed")?;

    row_to_sync_job(row)
}

pub async fn get_sync_job(pool: &PgPool, id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query("select * from sync_jobs where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("get_sync_job query failed")?;
    row.map(row_to_sync_job).transpose()
}

pub async fn list_sync_jobs(
    pool: &PgPool,
    upstream_instance_id: Option<&str>,
    limit: i64,
) -> Result<Vec<SyncJob>> {
    let rows = match upstream_instance_id {
        Some(instance_id) => {
            sqlx::query(
                "select * from sync_jobs where upstream_instance_id = $1
                 order by created_at desc limit $2",
            )
            .bind(instance_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query("select * from sync_jobs order by created_at desc limit $1")
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
    .context("list_sync_jobs query failed")?;

    rows.into_iter().map(row_to_sync_job).collect()
}

pub async fn mark_sync_job_started(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("update sync_jobs set status = 'processing', started_at = now() where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_sync_job_started failed")?;
    Ok(())
}

pub async fn mark_sync_job_completed(
    pool: &PgPool,
    id: &str,
    records_synced: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_jobs
           set status = 'completed',
               completed_at = now(),
               records_synced = $2,
               duration_seconds = extract(epoch from (now() - started_at))
         where id = $1
        "#,
    )
    .bind(id)
    .bind(records_synced)
    .execute(pool)
    .await
    .context("mark_sync_job_completed failed")?;
    Ok(())
}

pub async fn mark_sync_job_failed(pool: &PgPool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        update sync_jobs
           set status = 'failed',
               completed_at = now(),
               error_message = $2,
               duration_seconds = extract(epoch from (now() - started_at))
         where id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("mark_sync_job_failed failed")?;
    Ok(())
}
