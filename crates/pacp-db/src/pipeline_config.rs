use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use pacp_schemas::PipelineConfig;

/// Fetch the singleton pipeline config row, seeding it with the default if
/// this is the first call against a fresh database.
pub async fn get_pipeline_config(pool: &PgPool) -> Result<PipelineConfig> {
    let row = sqlx::query("select config_json from pipeline_config where id")
        .fetch_optional(pool)
        .await
        .context("get_pipeline_config query failed")?;

    match row {
        Some(row) => {
            let json: serde_json::Value = row.try_get("config_json")?;
            serde_json::from_value(json).context("corrupt pipeline_config row")
        }
        None => {
            let default = PipelineConfig::default();
            put_pipeline_config(pool, &default).await?;
            Ok(default)
        }
    }
}

pub async fn put_pipeline_config(pool: &PgPool, cfg: &PipelineConfig) -> Result<()> {
    cfg.processing_capacity
        .validate()
        .map_err(anyhow::Error::msg)?;

    let json = serde_json::to_value(cfg).context("serialize pipeline config failed")?;

    sqlx::query(
        r#"
        insert into pipeline_config (id, config_json)
        values (true, $1)
        on conflict (id) do update
            set config_json = excluded.config_json,
                updated_at = now()
        "#,
    )
    .bind(json)
    .execute(pool)
    .await
    .context("put_pipeline_config upsert failed")?;

    Ok(())
}
