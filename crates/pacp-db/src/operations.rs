use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use pacp_schemas::{
    new_id, HourlyBucket, Operation, OperationFilters, OperationStats, OperationStatus,
    OperationType, Outcome, Page, Priority, SortField, SortOrder,
};

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub priority: Priority,
    pub payload: Value,
    pub max_retries: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub upstream_instance_id: Option<String>,
    pub correlation_id: Option<String>,
}

fn row_to_operation(row: sqlx::postgres::PgRow) -> Result<Operation> {
    let type_str: String = row.try_get("operation_type")?;
    let priority_str: String = row.try_get("priority")?;
    let status_str: String = row.try_get("status")?;

    Ok(Operation {
        id: row.try_get("id")?,
        operation_type: OperationType::parse(&type_str)
            .ok_or_else(|| anyhow!("corrupt operation_type: {type_str}"))?,
        priority: Priority::parse(&priority_str)
            .ok_or_else(|| anyhow!("corrupt priority: {priority_str}"))?,
        status: OperationStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("corrupt status: {status_str}"))?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_by: row.try_get("created_by")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        correlation_id: row.try_get("correlation_id")?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_operation(pool: &PgPool, new: NewOperation) -> Result<Operation> {
    let id = new_id(pacp_schemas::ids::OPERATION_PREFIX);
    let scheduled_at = new.scheduled_at.unwrap_or_else(Utc::now);

    let row = sqlx::query(
        r#"
        insert into operations
            (id, operation_type, priority, status, payload, max_retries,
             scheduled_at, created_by, upstream_instance_id, correlation_id)
        values ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9)
        returning *
        "#,
    )
    .bind(&id)
    .bind(new.operation_type.as_str())
    .bind(new.priority.as_str())
    .bind(&new.payload)
    .bind(new.max_retries)
    .bind(scheduled_at)
    .bind(&new.created_by)
    .bind(&new.upstream_instance_id)
    .bind(&new.correlation_id)
    .fetch_one(pool)
    .await
    .context("create_operation insert failed")?;

    row_to_operation(row)
}

pub async fn get_operation(pool: &PgPool, id: &str) -> Result<Option<Operation>> {
    let row = sqlx::query("select * from operations where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("get_operation query failed")?;

    row.map(row_to_operation).transpose()
}

pub async fn list_operations(
    pool: &PgPool,
    filters: &OperationFilters,
    sort_by: SortField,
    sort_order: SortOrder,
    page: &Page,
) -> Result<Vec<Operation>> {
    let mut sql = String::from("select * from operations where 1=1");
    push_filter_clauses(&mut sql, filters);
    sql.push_str(&format!(
        " order by {} {} limit {} offset {}",
        sort_by.column(),
        sort_order.as_sql(),
        page.limit(),
        page.offset()
    ));

    let mut query = sqlx::query(&sql);
    query = bind_filter_values(query, filters);

    let rows = query
        .fetch_all(pool)
        .await
        .context("list_operations query failed")?;

    rows.into_iter().map(row_to_operation).collect()
}

pub async fn count_operations(pool: &PgPool, filters: &OperationFilters) -> Result<i64> {
    let mut sql = String::from("select count(*) as n from operations where 1=1");
    push_filter_clauses(&mut sql, filters);

    let mut query = sqlx::query(&sql);
    query = bind_filter_values(query, filters);

    let row = query
        .fetch_one(pool)
        .await
        .context("count_operations query failed")?;

    Ok(row.try_get::<i64, _>("n")?)
}

/// Appends `and ...` clauses for whichever filters are set. Placeholder
/// numbering matches `bind_filter_values`'s bind order exactly — both
/// functions must be edited together.
fn push_filter_clauses(sql: &mut String, filters: &OperationFilters) {
    let mut n = 0;
    let mut next = || {
        n += 1;
        n
    };

    if filters.status.is_some() {
        sql.push_str(&format!(" and status = ${}", next()));
    }
    if filters.operation_type.is_some() {
        sql.push_str(&format!(" and operation_type = ${}", next()));
    }
    if filters.priority.is_some() {
        sql.push_str(&format!(" and priority = ${}", next()));
    }
    if filters.created_by.is_some() {
        sql.push_str(&format!(" and created_by = ${}", next()));
    }
    if filters.correlation_id.is_some() {
        sql.push_str(&format!(" and correlation_id = ${}", next()));
    }
    if filters.upstream_instance_id.is_some() {
        sql.push_str(&format!(" and upstream_instance_id = ${}", next()));
    }
    if filters.start_date.is_some() {
        sql.push_str(&format!(" and created_at >= ${}", next()));
    }
    if filters.end_date.is_some() {
        sql.push_str(&format!(" and created_at <= ${}", next()));
    }
    if filters.search.is_some() {
        let n = next();
        sql.push_str(&format!(" and (id ilike ${n} or operation_type ilike ${n})"));
    }
}

fn bind_filter_values<'a>(
    mut query: sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments>,
    filters: &'a OperationFilters,
) -> sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments> {
    if let Some(v) = filters.status {
        query = query.bind(v.as_str());
    }
    if let Some(v) = filters.operation_type {
        query = query.bind(v.as_str());
    }
    if let Some(v) = filters.priority {
        query = query.bind(v.as_str());
    }
    if let Some(v) = &filters.created_by {
        query = query.bind(v);
    }
    if let Some(v) = &filters.correlation_id {
        query = query.bind(v);
    }
    if let Some(v) = &filters.upstream_instance_id {
        query = query.bind(v);
    }
    if let Some(v) = filters.start_date {
        query = query.bind(v);
    }
    if let Some(v) = filters.end_date {
        query = query.bind(v);
    }
    if let Some(v) = &filters.search {
        query = query.bind(format!("%{v}%"));
    }
    query
}

/// Cancel a pending or processing operation. Returns `false` if the
/// operation is already terminal (spec: cancel does not interrupt
/// in-flight upstream calls, it only stops further retries/claims).
pub async fn cancel_operation(pool: &PgPool, id: &str) -> Result<bool> {
    let row = sqlx::query(
        r#"
        update operations
           set status = 'cancelled',
               completed_at = now(),
               updated_at = now()
         where id = $1
           and status in ('pending', 'processing')
        returning id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("cancel_operation update failed")?;

    Ok(row.is_some())
}

/// Policy selecting how `claim_next` orders candidates across lanes (spec
/// §4.1's two priority disciplines).
#[derive(Debug, Clone, Copy)]
pub enum ClaimPolicy {
    /// Claim only from the given lane.
    Lane(Priority),
    /// Claim across all lanes, highest priority first.
    Global,
}

#[cfg(feature = "scheduler-claim")]
pub async fn claim_next(
    pool: &PgPool,
    policy: ClaimPolicy,
    dispatcher_id: &str,
) -> Result<Option<Operation>> {
    let row = match policy {
        ClaimPolicy::Lane(priority) => {
            sqlx::query(
                r#"
                with to_claim as (
                    select id
                    from operations
                    where status = 'pending'
                      and priority = $1
                      and scheduled_at <= now()
                    order by scheduled_at asc
                    limit 1
                    for update skip locked
                )
                update operations
                   set status = 'processing',
                       started_at = now(),
                       claimed_by = $2,
                       updated_at = now()
                 where id in (select id from to_claim)
                returning *
                "#,
            )
            .bind(priority.as_str())
            .bind(dispatcher_id)
            .fetch_optional(pool)
            .await
        }
        ClaimPolicy::Global => {
            sqlx::query(
                r#"
                with to_claim as (
                    select id
                    from operations
                    where status = 'pending'
                      and scheduled_at <= now()
                    order by
                        case priority
                            when 'high' then 0
                            when 'medium' then 1
                            when 'normal' then 2
                            when 'low' then 3
                        end,
                        scheduled_at asc
                    limit 1
                    for update skip locked
                )
                update operations
                   set status = 'processing',
                       started_at = now(),
                       claimed_by = $1,
                       updated_at = now()
                 where id in (select id from to_claim)
                returning *
                "#,
            )
            .bind(dispatcher_id)
            .fetch_optional(pool)
            .await
        }
    }
    .context("claim_next failed")?;

    row.map(row_to_operation).transpose()
}

/// Apply the outcome of a handler invocation to the claimed row (spec
/// §4.1/§4.5/§7). Best-effort: failing to finalise leaves the row
/// `processing`, to be picked up by the stuck-row reconciliation sweep.
pub async fn finalise(pool: &PgPool, id: &str, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Completed(result) => {
            sqlx::query(
                r#"
                update operations
                   set status = 'completed',
                       result = $2,
                       completed_at = now(),
                       updated_at = now()
                 where id = $1
                "#,
            )
            .bind(id)
            .bind(result)
            .execute(pool)
            .await
            .context("finalise(completed) failed")?;
        }
        Outcome::Failed(error) => {
            sqlx::query(
                r#"
                update operations
                   set status = 'failed',
                       error_message = $2,
                       completed_at = now(),
                       updated_at = now()
                 where id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(pool)
            .await
            .context("finalise(failed) failed")?;
        }
        Outcome::RetryAfter { delay, error } => {
            sqlx::query(
                r#"
                update operations
                   set status = 'pending',
                       retry_count = retry_count + 1,
                       error_message = $2,
                       scheduled_at = now() + $3::interval,
                       claimed_by = null,
                       started_at = null,
                       updated_at = now()
                 where id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(format!("{} seconds", delay.num_seconds()))
            .execute(pool)
            .await
            .context("finalise(retry) failed")?;
        }
        Outcome::Cancelled => {
            sqlx::query(
                r#"
                update operations
                   set status = 'cancelled',
                       completed_at = now(),
                       updated_at = now()
                 where id = $1
                "#,
            )
            .bind(id)
            .execute(pool)
            .await
            .context("finalise(cancelled) failed")?;
        }
    }

    Ok(())
}

/// Reclaim rows stuck `processing` past `ttl_seconds` since `started_at`
/// back to `pending`, logging the dispatcher that lost them. Grounded on
/// the teacher's `enforce_deadman_or_halt` periodic-check-and-correct
/// shape, generalised from one sticky HALT to a per-row reclaim.
pub async fn reclaim_stuck_processing(pool: &PgPool, ttl_seconds: i64) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        update operations
           set status = 'pending',
               claimed_by = null,
               started_at = null,
               updated_at = now()
         where status = 'processing'
           and started_at is not null
           and started_at < now() - ($1::text || ' seconds')::interval
        returning id, claimed_by
        "#,
    )
    .bind(ttl_seconds.to_string())
    .fetch_all(pool)
    .await
    .context("reclaim_stuck_processing failed")?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        tracing::warn!(operation_id = %id, "operation/reclaimed-stuck");
        ids.push(id);
    }
    Ok(ids)
}

pub async fn get_operation_stats(
    pool: &PgPool,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
) -> Result<OperationStats> {
    let mut stats = OperationStats::default();

    let by_status = sqlx::query(
        "select status, count(*) as n from operations
         where created_at between $1 and $2 group by status",
    )
    .bind(start_date)
    .bind(end_date)
    .fetch_all(pool)
    .await
    .context("get_operation_stats(by_status) failed")?;
    for row in by_status {
        stats
            .by_status
            .insert(row.try_get::<String, _>("status")?, row.try_get("n")?);
    }

    let by_type = sqlx::query(
        "select operation_type, count(*) as n from operations
         where created_at between $1 and $2 group by operation_type",
    )
    .bind(start_date)
    .bind(end_date)
    .fetch_all(pool)
    .await
    .context("get_operation_stats(by_type) failed")?;
    for row in by_type {
        stats.by_type.insert(
            row.try_get::<String, _>("operation_type")?,
            row.try_get("n")?,
        );
    }

    let by_priority = sqlx::query(
        "select priority, count(*) as n from operations
         where created_at between $1 and $2 group by priority",
    )
    .bind(start_date)
    .bind(end_date)
    .fetch_all(pool)
    .await
    .context("get_operation_stats(by_priority) failed")?;
    for row in by_priority {
        stats.by_priority.insert(
            row.try_get::<String, _>("priority")?,
            row.try_get("n")?,
        );
    }

    let hourly = sqlx::query(
        "select date_trunc('hour', created_at) as hour, count(*) as n from operations
         where created_at between $1 and $2 group by hour order by hour",
    )
    .bind(start_date)
    .bind(end_date)
    .fetch_all(pool)
    .await
    .context("get_operation_stats(hourly) failed")?;
    for row in hourly {
        stats.hourly_histogram.push(HourlyBucket {
            hour: row.try_get("hour")?,
            count: row.try_get("n")?,
        });
    }

    let (avg_wait, avg_process): (Option<f64>, Option<f64>) = sqlx::query_as(
        r#"
        select
            avg(extract(epoch from (started_at - scheduled_at))) as avg_wait,
            avg(extract(epoch from (completed_at - started_at))) as avg_process
        from operations
        where created_at between $1 and $2
          and started_at is not null
        "#,
    )
    .bind(start_date)
    .bind(end_date)
    .fetch_one(pool)
    .await
    .context("get_operation_stats(averages) failed")?;
    stats.avg_wait_seconds = avg_wait;
    stats.avg_process_seconds = avg_process;

    Ok(stats)
}
