//! Axum router and all HTTP handlers for pacp-daemon (spec §6).
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly, mirroring `mqk-daemon::routes`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use pacp_activity::{ActivityFilters, ActivityItem, ActivityKind};
use pacp_capool::CaPool;
use pacp_eventbus::PlaneEvent;
use pacp_schemas::{
    CertificateAuthority, InstanceSyncConfig, NewOperation, Operation, OperationFilters,
    OperationType, Page, PipelineConfig, PlaneError, Priority, SortField, SortOrder, SyncType,
};

use crate::state::{uptime_secs, AppState, BuildInfo};

type AppResult<T> = Result<T, PlaneError>;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/operations", post(create_operation).get(list_operations))
        .route("/operations/stats", get(operation_stats))
        .route("/operations/:id", get(get_operation))
        .route(
            "/operations/:id/cancel",
            post(cancel_operation).delete(cancel_operation),
        )
        .route("/pipeline/config", get(get_pipeline_config).patch(patch_pipeline_config))
        .route("/sync/schedules", get(list_sync_schedules))
        .route(
            "/sync/schedules/:instance/:entity",
            patch(patch_sync_schedule),
        )
        .route("/sync/trigger/:instance/:entity", post(trigger_sync))
        .route("/sync/pause-all", post(pause_all_sync))
        .route("/sync/resume-all", post(resume_all_sync))
        .route("/ca", get(list_cas).post(create_ca))
        .route("/ca/refresh", post(refresh_ca))
        .route("/ca/:id", axum::routing::put(update_ca).delete(delete_ca))
        .route("/activity", get(list_activity))
        .route("/activity/stream", get(activity_stream))
        .route("/sync/stream", get(sync_stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let BuildInfo { service, version } = st.build;
    (
        StatusCode::OK,
        Json(HealthResponse { ok: true, service, version, uptime_secs: uptime_secs() }),
    )
}

// ---------------------------------------------------------------------------
// POST /operations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateOperationRequest {
    #[serde(rename = "type")]
    operation_type: OperationType,
    #[serde(default = "default_priority")]
    priority: Priority,
    payload: Value,
    #[serde(default)]
    max_retries: Option<i32>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    created_by: Option<String>,
    #[serde(default)]
    upstream_instance_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

fn default_priority() -> Priority {
    Priority::Normal
}

async fn create_operation(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateOperationRequest>,
) -> AppResult<Response> {
    let handler = st.registry.get(req.operation_type).ok_or_else(|| {
        PlaneError::Validation(format!("no handler registered for {:?}", req.operation_type))
    })?;
    handler.validate_payload(&req.payload)?;

    let cfg = pacp_db::get_pipeline_config(&st.db).await?;
    let op = pacp_db::create_operation(
        &st.db,
        NewOperation {
            operation_type: req.operation_type,
            priority: req.priority,
            payload: req.payload,
            max_retries: req.max_retries.unwrap_or(cfg.retry_policy.max_attempts),
            scheduled_at: req.scheduled_at,
            created_by: req.created_by,
            upstream_instance_id: req.upstream_instance_id,
            correlation_id: req.correlation_id,
        },
    )
    .await?;

    st.bus.publish(PlaneEvent::OperationCreated { operation: op.clone() });
    Ok((StatusCode::CREATED, Json(op)).into_response())
}

// ---------------------------------------------------------------------------
// GET /operations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OperationsQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    operation_type: Option<String>,
    priority: Option<String>,
    correlation_id: Option<String>,
    upstream_instance_id: Option<String>,
    created_by: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    search: Option<String>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Serialize)]
struct OperationsListResponse {
    operations: Vec<Operation>,
    total: i64,
    page: u32,
    page_size: u32,
}

fn parse_rfc3339(field: &str, raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PlaneError::Validation(format!("{field} must be RFC3339")))
}

async fn list_operations(
    State(st): State<Arc<AppState>>,
    Query(q): Query<OperationsQuery>,
) -> AppResult<Json<OperationsListResponse>> {
    let filters = OperationFilters {
        status: q
            .status
            .as_deref()
            .map(|s| {
                pacp_schemas::OperationStatus::parse(s)
                    .ok_or_else(|| PlaneError::Validation(format!("invalid status '{s}'")))
            })
            .transpose()?,
        operation_type: q
            .operation_type
            .as_deref()
            .map(|s| {
                OperationType::parse(s)
                    .ok_or_else(|| PlaneError::Validation(format!("invalid type '{s}'")))
            })
            .transpose()?,
        priority: q
            .priority
            .as_deref()
            .map(|s| {
                Priority::parse(s).ok_or_else(|| PlaneError::Validation(format!("invalid priority '{s}'")))
            })
            .transpose()?,
        created_by: q.created_by,
        correlation_id: q.correlation_id,
        upstream_instance_id: q.upstream_instance_id,
        start_date: q.start_date.as_deref().map(|s| parse_rfc3339("start_date", s)).transpose()?,
        end_date: q.end_date.as_deref().map(|s| parse_rfc3339("end_date", s)).transpose()?,
        search: q.search,
    };

    let sort_by = q
        .sort_by
        .as_deref()
        .map(|s| SortField::parse(s).ok_or_else(|| PlaneError::Validation(format!("invalid sort_by '{s}'"))))
        .transpose()?
        .unwrap_or(SortField::CreatedAt);
    let sort_order = q
        .sort_order
        .as_deref()
        .map(|s| SortOrder::parse(s).ok_or_else(|| PlaneError::Validation(format!("invalid sort_order '{s}'"))))
        .transpose()?
        .unwrap_or(SortOrder::Desc);

    let page_size = q.page_size.unwrap_or(20).clamp(1, 100);
    let page = Page { page: q.page.unwrap_or(1).max(1), page_size };

    let (operations, total) = (
        pacp_db::list_operations(&st.db, &filters, sort_by, sort_order, &page).await?,
        pacp_db::count_operations(&st.db, &filters).await?,
    );

    Ok(Json(OperationsListResponse { operations, total, page: page.page, page_size: page.page_size }))
}

// ---------------------------------------------------------------------------
// GET /operations/:id
// ---------------------------------------------------------------------------

async fn get_operation(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> AppResult<Json<Operation>> {
    let op = pacp_db::get_operation(&st.db, &id)
        .await?
        .ok_or_else(|| PlaneError::NotFound(format!("operation {id}")))?;
    Ok(Json(op))
}

// ---------------------------------------------------------------------------
// POST|DELETE /operations/:id/cancel
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

async fn cancel_operation(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> AppResult<Response> {
    let existing = pacp_db::get_operation(&st.db, &id)
        .await?
        .ok_or_else(|| PlaneError::NotFound(format!("operation {id}")))?;

    let cancelled = pacp_db::cancel_operation(&st.db, &id).await?;
    if !cancelled {
        return Err(PlaneError::NotCancellable(format!(
            "operation {id} is already {}",
            existing.status.as_str()
        )));
    }

    if let Some(updated) = pacp_db::get_operation(&st.db, &id).await? {
        st.bus.publish(PlaneEvent::OperationUpdated { operation: updated });
    }

    Ok((StatusCode::OK, Json(MessageResponse { message: "cancelled" })).into_response())
}

// ---------------------------------------------------------------------------
// GET /operations/stats
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StatsQuery {
    start_date: String,
    end_date: String,
}

async fn operation_stats(
    State(st): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> AppResult<Json<pacp_schemas::OperationStats>> {
    let start = parse_rfc3339("start_date", &q.start_date)?;
    let end = parse_rfc3339("end_date", &q.end_date)?;
    let stats = pacp_db::get_operation_stats(&st.db, start, end).await?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// GET|PATCH /pipeline/config
// ---------------------------------------------------------------------------

async fn get_pipeline_config(State(st): State<Arc<AppState>>) -> AppResult<Json<PipelineConfig>> {
    Ok(Json(pacp_db::get_pipeline_config(&st.db).await?))
}

async fn patch_pipeline_config(
    State(st): State<Arc<AppState>>,
    Json(patch): Json<Value>,
) -> AppResult<Json<PipelineConfig>> {
    let mut cfg = pacp_db::get_pipeline_config(&st.db).await?;

    if let Some(v) = patch.get("processing_capacity") {
        cfg.processing_capacity = serde_json::from_value(v.clone())
            .map_err(|e| PlaneError::Validation(format!("invalid processing_capacity: {e}")))?;
    }
    if let Some(v) = patch.get("retry_policy") {
        cfg.retry_policy = serde_json::from_value(v.clone())
            .map_err(|e| PlaneError::Validation(format!("invalid retry_policy: {e}")))?;
    }
    if let Some(v) = patch.get("operation_timeouts") {
        cfg.operation_timeouts = serde_json::from_value(v.clone())
            .map_err(|e| PlaneError::Validation(format!("invalid operation_timeouts: {e}")))?;
    }

    cfg.processing_capacity.validate().map_err(PlaneError::Validation)?;

    pacp_db::put_pipeline_config(&st.db, &cfg).await?;
    Ok(Json(cfg))
}

// ---------------------------------------------------------------------------
// GET /sync/schedules
// ---------------------------------------------------------------------------

async fn list_sync_schedules(
    State(st): State<Arc<AppState>>,
) -> AppResult<Json<Vec<InstanceSyncConfig>>> {
    Ok(Json(pacp_db::list_all_sync_configs(&st.db).await?))
}

// ---------------------------------------------------------------------------
// PATCH /sync/schedules/:instance/:entity
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct PatchSyncScheduleBody {
    enabled: Option<bool>,
    interval_minutes: Option<i32>,
    page_size: Option<i32>,
    retry_attempts: Option<i32>,
    timeout_minutes: Option<i32>,
}

fn parse_sync_type(entity: &str) -> AppResult<SyncType> {
    SyncType::parse(entity).ok_or_else(|| PlaneError::Validation(format!("invalid sync entity '{entity}'")))
}

async fn patch_sync_schedule(
    State(st): State<Arc<AppState>>,
    Path((instance, entity)): Path<(String, String)>,
    Json(body): Json<PatchSyncScheduleBody>,
) -> AppResult<Json<InstanceSyncConfig>> {
    let sync_type = parse_sync_type(&entity)?;

    let mut cfg = pacp_db::get_sync_config(&st.db, &instance, sync_type)
        .await?
        .unwrap_or(InstanceSyncConfig {
            upstream_instance_id: instance.clone(),
            sync_type,
            enabled: true,
            interval_minutes: 60,
            page_size: 100,
            retry_attempts: 3,
            timeout_minutes: 30,
            last_sync_at: None,
        });

    if let Some(v) = body.enabled {
        cfg.enabled = v;
    }
    if let Some(v) = body.interval_minutes {
        cfg.interval_minutes = v;
    }
    if let Some(v) = body.page_size {
        cfg.page_size = v;
    }
    if let Some(v) = body.retry_attempts {
        cfg.retry_attempts = v;
    }
    if let Some(v) = body.timeout_minutes {
        cfg.timeout_minutes = v;
    }

    cfg.validate().map_err(PlaneError::Validation)?;
    let saved = pacp_db::upsert_instance_sync_config(&st.db, &cfg).await?;
    Ok(Json(saved))
}

// ---------------------------------------------------------------------------
// POST /sync/trigger/:instance/:entity
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct TriggerSyncBody {
    created_by: Option<String>,
}

async fn trigger_sync(
    State(st): State<Arc<AppState>>,
    Path((instance, entity)): Path<(String, String)>,
    body: Option<Json<TriggerSyncBody>>,
) -> AppResult<Response> {
    let sync_type = parse_sync_type(&entity)?;
    let created_by = body.map(|Json(b)| b.created_by).unwrap_or(None);

    let op = pacp_sync::trigger_manual_sync(&st.db, &instance, sync_type, created_by).await?;
    st.bus.publish(PlaneEvent::OperationCreated { operation: op.clone() });
    Ok((StatusCode::CREATED, Json(op)).into_response())
}

// ---------------------------------------------------------------------------
// POST /sync/pause-all, /sync/resume-all
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct BulkUpdateResponse {
    updated: u64,
}

async fn pause_all_sync(State(st): State<Arc<AppState>>) -> AppResult<Json<BulkUpdateResponse>> {
    let updated = pacp_db::set_all_sync_configs_enabled(&st.db, false).await?;
    Ok(Json(BulkUpdateResponse { updated }))
}

async fn resume_all_sync(State(st): State<Arc<AppState>>) -> AppResult<Json<BulkUpdateResponse>> {
    let updated = pacp_db::set_all_sync_configs_enabled(&st.db, true).await?;
    Ok(Json(BulkUpdateResponse { updated }))
}

// ---------------------------------------------------------------------------
// GET|POST /ca, PUT|DELETE /ca/:id, POST /ca/refresh
// ---------------------------------------------------------------------------

async fn list_cas(State(st): State<Arc<AppState>>) -> AppResult<Json<Vec<CertificateAuthority>>> {
    Ok(Json(pacp_db::list_certificate_authorities(&st.db).await?))
}

#[derive(Deserialize)]
struct CreateCaRequest {
    name: String,
    pem: String,
}

async fn create_ca(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateCaRequest>,
) -> AppResult<Response> {
    let parsed = pacp_capool::parse_ca_pem(&req.pem)
        .map_err(|e| PlaneError::Validation(format!("unparseable CA PEM: {e}")))?;

    let existing = pacp_db::list_certificate_authorities(&st.db).await?;
    if existing.iter().any(|ca| ca.fingerprint == parsed.fingerprint) {
        return Err(PlaneError::Conflict(format!(
            "a certificate authority with fingerprint {} already exists",
            parsed.fingerprint
        )));
    }

    let ca = pacp_db::create_certificate_authority(
        &st.db,
        pacp_db::NewCertificateAuthority {
            name: req.name,
            fingerprint: parsed.fingerprint,
            pem: req.pem,
            subject: parsed.subject,
            issuer: parsed.issuer,
            not_before: parsed.not_before,
            not_after: parsed.not_after,
            is_root: parsed.is_root,
            is_intermediate: parsed.is_intermediate,
            chain_info: parsed.chain_info,
        },
    )
    .await?;

    force_refresh(&st.capool).await?;
    Ok((StatusCode::CREATED, Json(ca)).into_response())
}

#[derive(Deserialize)]
struct UpdateCaRequest {
    is_active: bool,
}

async fn update_ca(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateCaRequest>,
) -> AppResult<Response> {
    let found = pacp_db::set_certificate_authority_active(&st.db, &id, req.is_active).await?;
    if !found {
        return Err(PlaneError::NotFound(format!("certificate authority {id}")));
    }
    force_refresh(&st.capool).await?;

    let ca = pacp_db::get_certificate_authority(&st.db, &id)
        .await?
        .ok_or_else(|| PlaneError::NotFound(format!("certificate authority {id}")))?;
    Ok((StatusCode::OK, Json(ca)).into_response())
}

async fn delete_ca(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> AppResult<Response> {
    let found = pacp_db::delete_certificate_authority(&st.db, &id).await?;
    if !found {
        return Err(PlaneError::NotFound(format!("certificate authority {id}")));
    }
    force_refresh(&st.capool).await?;
    Ok((StatusCode::OK, Json(MessageResponse { message: "deleted" })).into_response())
}

async fn refresh_ca(State(st): State<Arc<AppState>>) -> AppResult<Response> {
    force_refresh(&st.capool).await?;
    let snapshot = st.capool.current_snapshot();
    Ok((
        StatusCode::OK,
        Json(json!({
            "refreshed": true,
            "active_ca_count": snapshot.active_ca_count,
            "skipped_count": snapshot.skipped_count,
            "built_at": snapshot.built_at,
        })),
    )
        .into_response())
}

async fn force_refresh(capool: &Arc<CaPool>) -> AppResult<()> {
    capool
        .force_refresh()
        .await
        .map_err(|e| PlaneError::Internal(format!("CA pool refresh failed: {e}")))
}

// ---------------------------------------------------------------------------
// GET /activity
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ActivityQuery {
    upstream_instance_id: Option<String>,
    kind: Option<String>,
    status: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

#[derive(Serialize)]
struct ActivityListResponse {
    items: Vec<ActivityItem>,
    total: i64,
    page: u32,
    page_size: u32,
}

async fn list_activity(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ActivityQuery>,
) -> AppResult<Json<ActivityListResponse>> {
    let filters = ActivityFilters {
        upstream_instance_id: q.upstream_instance_id,
        kind: q
            .kind
            .as_deref()
            .map(|s| ActivityKind::parse(s).ok_or_else(|| PlaneError::Validation(format!("invalid kind '{s}'"))))
            .transpose()?,
        status: q.status,
    };

    let page = q.page.unwrap_or(1).max(1);
    let page_size = q.page_size.unwrap_or(20).clamp(1, 100);

    let items = pacp_activity::list_activity(&st.db, &filters, page, page_size).await?;
    let total = pacp_activity::count_activity(&st.db, &filters).await?;

    Ok(Json(ActivityListResponse { items, total, page, page_size }))
}

// ---------------------------------------------------------------------------
// GET /activity/stream, /sync/stream  (SSE)
// ---------------------------------------------------------------------------

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    headers
}

fn connected_event() -> Result<Event, Infallible> {
    let client_id = Uuid::new_v4();
    Ok(Event::default().event("connected").data(json!({ "client_id": client_id }).to_string()))
}

fn event_to_sse(event: PlaneEvent) -> Result<Event, Infallible> {
    let name = event.event_name();
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(name).data(data))
}

async fn activity_stream(State(st): State<Arc<AppState>>) -> Response {
    let initial = stream::once(async { connected_event() });
    let rest = st.bus.subscribe_stream().map(event_to_sse);
    let events = initial.chain(rest);

    (sse_headers(), Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

async fn sync_stream(State(st): State<Arc<AppState>>) -> Response {
    let initial = stream::once(async { connected_event() });
    let rest = st
        .bus
        .subscribe_stream()
        .filter(|event| {
            futures_util::future::ready(matches!(
                event,
                PlaneEvent::SyncJobCreated { .. } | PlaneEvent::SyncJobUpdated { .. } | PlaneEvent::Heartbeat { .. }
            ))
        })
        .map(event_to_sse);
    let events = initial.chain(rest);

    (sse_headers(), Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}
