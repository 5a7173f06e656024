//! Scheduler: claims pending operations under a priority policy, runs the
//! matching handler with a timeout, and finalises the outcome (spec §4.5).
//!
//! Two worker-loop strategies share the same claim/run/finalise template —
//! `LaneScheduler` (N workers split across priority lanes by configured
//! fraction) and `SerialScheduler` (one worker, global CASE ordering) —
//! grounded on the teacher's outbox-claim dispatch loop generalised from a
//! single dispatcher to either shape.

mod backoff;
mod lane;
mod metrics;
mod serial;

pub use backoff::BackoffPolicy;
pub use lane::LaneScheduler;
pub use metrics::SchedulerMetrics;
pub use serial::SerialScheduler;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use pacp_db::ClaimPolicy;
use pacp_handlers::HandlerRegistry;
use pacp_schemas::{Operation, OperationTimeouts, Outcome, PlaneError};

/// Poll interval when a claim attempt finds nothing to do (spec §4.5's
/// "on empty sleep 100 ms").
const EMPTY_CLAIM_BACKOFF: Duration = Duration::from_millis(100);

/// How long `stop()` waits for in-flight workers to drain before giving up
/// (spec §9's "explicit stop contract" for every process-singleton
/// component).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Claim one operation under `policy`, run its handler with a timeout, and
/// finalise the outcome. Shared by every worker loop in both scheduler
/// shapes. Returns `true` if a row was claimed (regardless of how it
/// finished), so callers know whether to back off before claiming again.
async fn run_one_claim(
    db: &PgPool,
    registry: &HandlerRegistry,
    timeouts: &OperationTimeouts,
    backoff: &BackoffPolicy,
    policy: ClaimPolicy,
    dispatcher_id: &str,
    metrics: &SchedulerMetrics,
) -> anyhow::Result<bool> {
    let Some(op) = pacp_db::claim_next(db, policy, dispatcher_id).await? else {
        return Ok(false);
    };

    metrics.worker_started();
    let outcome = execute_with_timeout(registry, timeouts, backoff, &op).await;
    metrics.worker_finished(op.operation_type);

    // Best-effort per spec §7: a finalise failure leaves the row
    // `processing`, to be swept up by `reclaim_stuck_processing` later.
    if let Err(e) = pacp_db::finalise(db, &op.id, outcome).await {
        tracing::error!(operation_id = %op.id, error = %e, "scheduler/finalise-failed");
    }

    Ok(true)
}

async fn execute_with_timeout(
    registry: &HandlerRegistry,
    timeouts: &OperationTimeouts,
    backoff: &BackoffPolicy,
    op: &Operation,
) -> Outcome {
    let Some(handler) = registry.get(op.operation_type) else {
        tracing::error!(operation_id = %op.id, operation_type = ?op.operation_type, "scheduler/no-handler-registered");
        return Outcome::Failed(format!("no handler registered for {:?}", op.operation_type));
    };

    let timeout = Duration::from_secs(timeouts.for_type(op.operation_type.as_str()));
    let result = tokio::time::timeout(timeout, handler.handle(op)).await;

    match result {
        Err(_) => classify_error(op, backoff, PlaneError::Transient("operation timed out".to_string())),
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => classify_error(op, backoff, e),
    }
}

/// Map a handler error to the `Outcome` the Store should record (spec §7's
/// propagation policy): `AuthUpstream` that escapes a handler is treated
/// as permanent, `Transient` feeds the retry path while retries remain,
/// anything else terminates the operation.
fn classify_error(op: &Operation, backoff: &BackoffPolicy, error: PlaneError) -> Outcome {
    if error.is_retryable() && op.retry_count < op.max_retries {
        let delay = backoff.delay(op.retry_count + 1);
        Outcome::RetryAfter { delay, error: error.to_string() }
    } else {
        Outcome::Failed(error.to_string())
    }
}

/// Periodically reclaim operations stuck in `processing` past
/// `timeout + grace` (spec §7's cold-start/periodic reconciliation
/// sweep). Intended to be run by whichever scheduler owns the process.
pub fn spawn_stuck_reclaim_loop(db: PgPool, ttl_seconds: i64, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match pacp_db::reclaim_stuck_processing(&db, ttl_seconds).await {
                Ok(ids) if !ids.is_empty() => {
                    tracing::warn!(count = ids.len(), "scheduler/reclaimed-stuck-operations");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "scheduler/reclaim-sweep-failed"),
            }
        }
    })
}

/// Shared shutdown helper: wait up to [`SHUTDOWN_TIMEOUT`] for every worker
/// to finish whatever operation it's currently running and exit on its
/// own (workers check the `running` flag between claims, not mid-handler),
/// only aborting the stragglers once that budget is actually exhausted.
async fn shutdown_handles(handles: Vec<tokio::task::JoinHandle<()>>) {
    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures_util_join_all(handles)).await;
    if joined.is_err() {
        tracing::warn!("scheduler/shutdown-timed-out-waiting-for-workers");
        for abort_handle in abort_handles {
            abort_handle.abort();
        }
    }
}

async fn futures_util_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacp_schemas::{OperationStatus, OperationType, Priority};

    fn sample_op(retry_count: i32, max_retries: i32) -> Operation {
        Operation {
            id: "op_test".to_string(),
            operation_type: OperationType::SafeProvision,
            priority: Priority::Normal,
            status: OperationStatus::Processing,
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            retry_count,
            max_retries,
            scheduled_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
            created_by: None,
            upstream_instance_id: None,
            correlation_id: None,
            claimed_by: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn transient_error_retries_while_budget_remains() {
        let backoff = BackoffPolicy::default();
        let op = sample_op(0, 3);
        let outcome = classify_error(&op, &backoff, PlaneError::Transient("x".to_string()));
        assert!(matches!(outcome, Outcome::RetryAfter { .. }));
    }

    #[test]
    fn transient_error_fails_once_retry_budget_is_exhausted() {
        let backoff = BackoffPolicy::default();
        let op = sample_op(3, 3);
        let outcome = classify_error(&op, &backoff, PlaneError::Transient("x".to_string()));
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    #[test]
    fn permanent_error_never_retries() {
        let backoff = BackoffPolicy::default();
        let op = sample_op(0, 3);
        let outcome = classify_error(&op, &backoff, PlaneError::Permanent("x".to_string()));
        assert!(matches!(outcome, Outcome::Failed(_)));
    }
}
