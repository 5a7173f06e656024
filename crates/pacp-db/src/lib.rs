//! Postgres store for the control plane. Thin function-per-operation API,
//! raw parameterised SQL, no ORM — matching the teacher's `mqk-db`.

mod ca;
mod instances;
mod mirror;
mod operations;
mod pipeline_config;
mod sync_jobs;

pub use ca::*;
pub use instances::*;
pub use mirror::*;
pub use operations::*;
pub use pipeline_config::*;
pub use sync_jobs::*;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub const ENV_DB_URL: &str = "PACP_DATABASE_URL";

pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded sqlx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub connected: bool,
    pub operations_table_present: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'operations'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status schema-presence query failed")?;

    Ok(DbStatus {
        connected: one == 1,
        operations_table_present: exists,
    })
}

/// Detect a Postgres unique-constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}
