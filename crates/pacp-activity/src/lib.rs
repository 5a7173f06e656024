//! Read-only unified Activity View (spec §4.9): merges `operations` and
//! `sync_jobs` rows by `created_at` for listing and live subscription.
//!
//! Grounded on `mqk-daemon::routes::{status_handler, stream}`'s read-side
//! query shape — a thin function over `sqlx::PgPool` returning a flattened
//! view type, no ORM, in the same style as `pacp-db`'s own modules.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

/// Which underlying table an [`ActivityItem`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Operation,
    SyncJob,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Operation => "operation",
            ActivityKind::SyncJob => "sync_job",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "operation" => ActivityKind::Operation,
            "sync_job" => ActivityKind::SyncJob,
            _ => return None,
        })
    }
}

/// One row of the unified feed. `label` carries the operation_type or
/// sync_type string so a single list can be rendered without a second
/// lookup per row.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub id: String,
    pub kind: ActivityKind,
    pub label: String,
    pub upstream_instance_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilters {
    pub upstream_instance_id: Option<String>,
    pub kind: Option<ActivityKind>,
    pub status: Option<String>,
}

fn row_to_item(row: sqlx::postgres::PgRow) -> Result<ActivityItem> {
    let kind_str: String = row.try_get("kind")?;
    Ok(ActivityItem {
        id: row.try_get("id")?,
        kind: ActivityKind::parse(&kind_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt activity kind: {kind_str}"))?,
        label: row.try_get("label")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

const UNION_SQL: &str = r#"
    select id, 'operation' as kind, operation_type as label, upstream_instance_id, status, created_at
      from operations
    union all
    select id, 'sync_job' as kind, sync_type as label, upstream_instance_id, status, created_at
      from sync_jobs
"#;

/// List activity items, most recent first, applying optional filters on
/// instance, kind, and status (spec §4.9).
pub async fn list_activity(
    pool: &PgPool,
    filters: &ActivityFilters,
    page: u32,
    page_size: u32,
) -> Result<Vec<ActivityItem>> {
    let sql = format!(
        "select * from ({UNION_SQL}) combined
         where ($1::text is null or upstream_instance_id = $1)
           and ($2::text is null or kind = $2)
           and ($3::text is null or status = $3)
         order by created_at desc
         limit $4 offset $5"
    );

    let offset = (page.saturating_sub(1) as i64) * page_size as i64;
    let rows = sqlx::query(&sql)
        .bind(&filters.upstream_instance_id)
        .bind(filters.kind.map(|k| k.as_str()))
        .bind(&filters.status)
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("list_activity query failed")?;

    rows.into_iter().map(row_to_item).collect()
}

/// Count matching rows across both tables, for pagination metadata.
pub async fn count_activity(pool: &PgPool, filters: &ActivityFilters) -> Result<i64> {
    let sql = format!(
        "select count(*) as n from ({UNION_SQL}) combined
         where ($1::text is null or upstream_instance_id = $1)
           and ($2::text is null or kind = $2)
           and ($3::text is null or status = $3)"
    );

    let row = sqlx::query(&sql)
        .bind(&filters.upstream_instance_id)
        .bind(filters.kind.map(|k| k.as_str()))
        .bind(&filters.status)
        .fetch_one(pool)
        .await
        .context("count_activity query failed")?;

    Ok(row.try_get::<i64, _>("n")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_kind_round_trips_through_str() {
        for kind in [ActivityKind::Operation, ActivityKind::SyncJob] {
            assert_eq!(ActivityKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn activity_kind_parse_rejects_unknown() {
        assert!(ActivityKind::parse("bogus").is_none());
    }
}
