use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};

use pacp_schemas::{new_id, ids, InstanceSyncConfig, SyncType, UpstreamInstance};

#[derive(Debug, Clone)]
pub struct NewUpstreamInstance {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub encrypted_password: String,
    pub skip_tls_verify: bool,
}

fn row_to_instance(row: sqlx::postgres::PgRow) -> Result<UpstreamInstance> {
    Ok(UpstreamInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        username: row.try_get("username")?,
        encrypted_password: row.try_get("encrypted_password")?,
        skip_tls_verify: row.try_get("skip_tls_verify")?,
        is_active: row.try_get("is_active")?,
        last_test_at: row.try_get("last_test_at")?,
        last_test_success: row.try_get("last_test_success")?,
        last_test_error: row.try_get("last_test_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_upstream_instance(
    pool: &PgPool,
    new: NewUpstreamInstance,
) -> Result<UpstreamInstance> {
    let id = new_id(ids::UPSTREAM_INSTANCE_PREFIX);
    let row = sqlx::query(
        r#"
        insert into upstream_instances
            (id, name, base_url, username, encrypted_password, skip_tls_verify)
        values ($1, $2, $3, $4, $5, $6)
        returning *
        "#,
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.base_url)
    .bind(&new.username)
    .bind(&new.encrypted_password)
    .bind(new.skip_tls_verify)
    .fetch_one(pool)
    .await
    .context("create_upstream_instance insert failed")?;

    row_to_instance(row)
}

pub async fn get_upstream_instance(pool: &PgPool, id: &str) -> Result<Option<UpstreamInstance>> {
    let row = sqlx::query("select * from upstream_instances where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("get_upstream_instance query failed")?;
    row.map(row_to_instance).transpose()
}

pub async fn list_upstream_instances(
    pool: &PgPool,
    active_only: bool,
) -> Result<Vec<UpstreamInstance>> {
    let sql = if active_only {
        "select * from upstream_instances where is_active order by created_at"
    } else {
        "select * from upstream_instances order by created_at"
    };
    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .context("list_upstream_instances query failed")?;
    rows.into_iter().map(row_to_instance).collect()
}

pub async fn record_connectivity_test(
    pool: &PgPool,
    id: &str,
    success: bool,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update upstream_instances
           set last_test_at = now(),
               last_test_success = $2,
               last_test_error = $3,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(id)
    .bind(success)
    .bind(error)
    .execute(pool)
    .await
    .context("record_connectivity_test update failed")?;
    Ok(())
}

fn row_to_sync_config(row: sqlx::postgres::PgRow) -> Result<InstanceSyncConfig> {
    let sync_type_str: String = row.try_get("sync_type")?;
    Ok(InstanceSyncConfig {
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        sync_type: SyncType::parse(&sync_type_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt sync_type: {sync_type_str}"))?,
        enabled: row.try_get("enabled")?,
        interval_minutes: row.try_get("interval_minutes")?,
        page_size: row.try_get("page_size")?,
        retry_attempts: row.try_get("retry_attempts")?,
        timeout_minutes: row.try_get("timeout_minutes")?,
        last_sync_at: row.try_get("last_sync_at")?,
    })
}

pub async fn upsert_instance_sync_config(
    pool: &PgPool,
    cfg: &InstanceSyncConfig,
) -> Result<InstanceSyncConfig> {
    cfg.validate().map_err(anyhow::Error::msg)?;

    let row = sqlx::query(
        r#"
        insert into instance_sync_configs
            (upstream_instance_id, sync_type, enabled, interval_minutes,
             page_size, retry_attempts, timeout_minutes)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (upstream_instance_id, sync_type) do update
            set enabled = excluded.enabled,
                interval_minutes = excluded.interval_minutes,
                page_size = excluded.page_size,
                retry_attempts = excluded.retry_attempts,
                timeout_minutes = excluded.timeout_minutes
        returning *
        "#,
    )
    .bind(&cfg.upstream_instance_id)
    .bind(cfg.sync_type.as_str())
    .bind(cfg.enabled)
    .bind(cfg.interval_minutes)
    .bind(cfg.page_size)
    .bind(cfg.retry_attempts)
    .bind(cfg.timeout_minutes)
    .fetch_one(pool)
    .await
    .context("upsert_instance_sync_config failed")?;

    row_to_sync_config(row)
}

/// All configured schedules across every instance (spec §6's `GET
/// /sync/schedules`), regardless of whether they're currently due.
pub async fn list_all_sync_configs(pool: &PgPool) -> Result<Vec<InstanceSyncConfig>> {
    let rows = sqlx::query("select * from instance_sync_configs order by upstream_instance_id, sync_type")
        .fetch_all(pool)
        .await
        .context("list_all_sync_configs query failed")?;
    rows.into_iter().map(row_to_sync_config).collect()
}

pub async fn get_sync_config(
    pool: &PgPool,
    upstream_instance_id: &str,
    sync_type: SyncType,
) -> Result<Option<InstanceSyncConfig>> {
    let row = sqlx::query(
        "select * from instance_sync_configs where upstream_instance_id = $1 and sync_type = $2",
    )
    .bind(upstream_instance_id)
    .bind(sync_type.as_str())
    .fetch_optional(pool)
    .await
    .context("get_sync_config query failed")?;
    row.map(row_to_sync_config).transpose()
}

/// Flip `enabled` for every configured schedule at once (spec §6's
/// `POST /sync/pause-all` / `POST /sync/resume-all`), returning the number
/// of rows touched.
pub async fn set_all_sync_configs_enabled(pool: &PgPool, enabled: bool) -> Result<u64> {
    let result = sqlx::query("update instance_sync_configs set enabled = $1")
        .bind(enabled)
        .execute(pool)
        .await
        .context("set_all_sync_configs_enabled failed")?;
    Ok(result.rows_affected())
}

pub async fn list_due_sync_configs(pool: &PgPool) -> Result<Vec<InstanceSyncConfig>> {
    let rows = sqlx::query(
        r#"
        select isc.* from instance_sync_configs isc
        join upstream_instances ui on ui.id = isc.upstream_instance_id
        where isc.enabled
          and ui.is_active
          and (
              isc.last_sync_at is null
              or isc.last_sync_at + (isc.interval_minutes || ' minutes')::interval <= now()
          )
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_due_sync_configs query failed")?;
    rows.into_iter().map(row_to_sync_config).collect()
}

/// Advance `last_sync_at` only if it still matches `expected_last_sync_at`,
/// so a concurrent scheduler tick can't double-enqueue the same sync
/// (spec §4.8).
pub async fn advance_last_sync_at_if_unchanged(
    pool: &PgPool,
    upstream_instance_id: &str,
    sync_type: SyncType,
    expected_last_sync_at: Option<chrono::DateTime<Utc>>,
) -> Result<bool> {
    let row = match expected_last_sync_at {
        Some(expected) => {
            sqlx::query(
                r#"
                update instance_sync_configs
                   set last_sync_at = now()
                 where upstream_instance_id = $1
                   and sync_type = $2
                   and last_sync_at = $3
                returning upstream_instance_id
                "#,
            )
            .bind(upstream_instance_id)
            .bind(sync_type.as_str())
            .bind(expected)
            .fetch_optional(pool)
            .await
        }
        None => {
            sqlx::query(
                r#"
                update instance_sync_configs
                   set last_sync_at = now()
                 where upstream_instance_id = $1
                   and sync_type = $2
                   and last_sync_at is null
                returning upstream_instance_id
                "#,
            )
            .bind(upstream_instance_id)
            .bind(sync_type.as_str())
            .fetch_optional(pool)
            .await
        }
    }
    .context("advance_last_sync_at_if_unchanged failed")?;

    Ok(row.is_some())
}
