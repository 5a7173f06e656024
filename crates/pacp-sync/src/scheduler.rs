use std::time::Duration;

use sqlx::PgPool;

use pacp_db::NewOperation;
use pacp_schemas::{InstanceSyncConfig, Operation, OperationType, Priority, SyncType};

/// Tick cadence for the scheduled-sync producer (spec §4.8).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

fn operation_type_for(sync_type: SyncType) -> OperationType {
    match sync_type {
        SyncType::Users => OperationType::UserSync,
        SyncType::Groups => OperationType::GroupSync,
        SyncType::Safes => OperationType::SafeSync,
    }
}

/// One scheduler tick: enqueue a `*_sync` operation for every due, enabled
/// config on an active instance, advancing `last_sync_at` first so a
/// concurrent tick can't double-enqueue the same sync (spec §4.8).
pub async fn tick_once(db: &PgPool) -> anyhow::Result<usize> {
    let due = pacp_db::list_due_sync_configs(db).await?;
    let mut enqueued = 0usize;

    for cfg in due {
        let advanced = pacp_db::advance_last_sync_at_if_unchanged(
            db,
            &cfg.upstream_instance_id,
            cfg.sync_type,
            cfg.last_sync_at,
        )
        .await?;

        if !advanced {
            // Another tick (or a manual trigger) already claimed this
            // config's due window between list and advance.
            continue;
        }

        let payload = serde_json::json!({
            "instance_id": cfg.upstream_instance_id,
            "sync_mode": "scheduled",
        });

        pacp_db::create_operation(
            db,
            NewOperation {
                operation_type: operation_type_for(cfg.sync_type),
                priority: Priority::Normal,
                payload,
                max_retries: cfg.retry_attempts,
                scheduled_at: None,
                created_by: None,
                upstream_instance_id: Some(cfg.upstream_instance_id.clone()),
                correlation_id: None,
            },
        )
        .await?;

        enqueued += 1;
    }

    Ok(enqueued)
}

/// Spawn the periodic tick loop, mirroring the teacher's heartbeat-ticker
/// shape: a long-lived task that ticks on a fixed interval and logs rather
/// than propagates a single tick's failure.
pub fn spawn_tick_loop(db: PgPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match tick_once(&db).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(enqueued = n, "sync-scheduler/tick"),
                Err(e) => tracing::warn!(error = %e, "sync-scheduler/tick-failed"),
            }
        }
    })
}

/// Enqueue a sync immediately, bypassing the interval check, at `High`
/// priority (spec §4.8's manual-trigger override).
pub async fn trigger_manual_sync(
    db: &PgPool,
    upstream_instance_id: &str,
    sync_type: SyncType,
    created_by: Option<String>,
) -> anyhow::Result<Operation> {
    let payload = serde_json::json!({
        "instance_id": upstream_instance_id,
        "sync_mode": "manual",
    });

    pacp_db::create_operation(
        db,
        NewOperation {
            operation_type: operation_type_for(sync_type),
            priority: Priority::High,
            payload,
            max_retries: InstanceSyncConfig::MAX_RETRY_ATTEMPTS,
            scheduled_at: None,
            created_by,
            upstream_instance_id: Some(upstream_instance_id.to_string()),
            correlation_id: None,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_each_sync_type_to_its_operation_type() {
        assert_eq!(operation_type_for(SyncType::Users), OperationType::UserSync);
        assert_eq!(operation_type_for(SyncType::Groups), OperationType::GroupSync);
        assert_eq!(operation_type_for(SyncType::Safes), OperationType::SafeSync);
    }
}
