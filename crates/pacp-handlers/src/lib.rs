//! Handler Registry: maps an `OperationType` to the `Handler` that
//! executes it (spec §4.6).
//!
//! Grounded on the teacher's `BrokerGateway`/`OrderRouter` trait-based
//! dispatch: a small async trait implemented once per operation kind,
//! collected into a lookup map built once at daemon startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use pacp_schemas::{Operation, OperationType, Outcome, PlaneError, SyncType};
use pacp_session::SessionCache;
use pacp_vault::VaultError;

fn vault_error_to_plane(e: VaultError) -> PlaneError {
    match e {
        VaultError::AuthFailed(msg) => PlaneError::AuthUpstream(msg),
        VaultError::Retryable(msg) => PlaneError::Transient(msg),
        VaultError::Permanent(msg) => PlaneError::Permanent(msg),
    }
}

fn required_str(payload: &Value, field: &str) -> Result<String, PlaneError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlaneError::Validation(format!("payload missing required field '{field}'")))
}

async fn load_instance(
    db: &PgPool,
    instance_id: &str,
) -> Result<pacp_schemas::UpstreamInstance, PlaneError> {
    pacp_db::get_upstream_instance(db, instance_id)
        .await?
        .ok_or_else(|| PlaneError::NotFound(format!("upstream instance {instance_id}")))
}

/// One operation type's execution logic. `validate_payload` runs before
/// the operation is enqueued (spec §4.1's "duck-typed payloads are
/// validated by the handler before work begins"); `handle` runs it.
#[async_trait]
pub trait Handler: Send + Sync {
    fn operation_type(&self) -> OperationType;

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError>;

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError>;
}

/// Lookup table built once at startup, the way `mqk-execution` wires
/// `BrokerGateway::new(broker)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.operation_type(), handler);
    }

    pub fn get(&self, operation_type: OperationType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&operation_type).cloned()
    }

    /// Build a registry with every handler wired against the same store
    /// and session cache, the shape `pacp-daemon`'s startup uses.
    pub fn build(db: PgPool, sessions: Arc<SessionCache>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SafeProvisionHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(SafeModifyHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(SafeDeleteHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(AccessGrantHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(AccessRevokeHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(UserSyncHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(SafeSyncHandler::new(db.clone(), sessions.clone())));
        registry.register(Arc::new(GroupSyncHandler::new(db, sessions)));
        registry
    }
}

/// Default page size for a sync operation whose payload doesn't override
/// it (spec §4.7 step 1's "optional page_size override (1..1000)").
const DEFAULT_SYNC_PAGE_SIZE: u64 = 100;

fn sync_page_size(payload: &Value) -> u64 {
    payload
        .get("page_size")
        .and_then(Value::as_u64)
        .filter(|n| (1..=1000).contains(n))
        .unwrap_or(DEFAULT_SYNC_PAGE_SIZE)
}

macro_rules! safe_handler {
    ($name:ident, $op_type:expr) => {
        pub struct $name {
            db: PgPool,
            sessions: Arc<SessionCache>,
        }

        impl $name {
            pub fn new(db: PgPool, sessions: Arc<SessionCache>) -> Self {
                Self { db, sessions }
            }
        }
    };
}

safe_handler!(SafeProvisionHandler, OperationType::SafeProvision);
safe_handler!(SafeModifyHandler, OperationType::SafeModify);
safe_handler!(SafeDeleteHandler, OperationType::SafeDelete);
safe_handler!(AccessGrantHandler, OperationType::AccessGrant);
safe_handler!(AccessRevokeHandler, OperationType::AccessRevoke);

#[async_trait]
impl Handler for SafeProvisionHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::SafeProvision
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
        required_str(payload, "instance_id")?;
        if payload.get("safe").is_none() {
            return Err(PlaneError::Validation("payload missing required field 'safe'".into()));
        }
        Ok(())
    }

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
        let instance_id = required_str(&op.payload, "instance_id")?;
        let safe = op
            .payload
            .get("safe")
            .cloned()
            .ok_or_else(|| PlaneError::Validation("payload missing required field 'safe'".into()))?;

        let instance = load_instance(&self.db, &instance_id).await?;
        let (client, token) = self
            .sessions
            .get_or_create(&instance)
            .await
            .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;

        let result = client
            .create_safe(&token, &safe)
            .await
            .map_err(vault_error_to_plane)?;

        tracing::info!(operation_id = %op.id, instance_id = %instance_id, "handler/safe-provisioned");
        Ok(Outcome::Completed(Some(result)))
    }
}

#[async_trait]
impl Handler for SafeModifyHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::SafeModify
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
        required_str(payload, "instance_id")?;
        required_str(payload, "safe_name")?;
        if payload.get("safe").is_none() {
            return Err(PlaneError::Validation("payload missing required field 'safe'".into()));
        }
        Ok(())
    }

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
        let instance_id = required_str(&op.payload, "instance_id")?;
        let safe_name = required_str(&op.payload, "safe_name")?;
        let safe = op
            .payload
            .get("safe")
            .cloned()
            .ok_or_else(|| PlaneError::Validation("payload missing required field 'safe'".into()))?;

        let instance = load_instance(&self.db, &instance_id).await?;
        let (client, token) = self
            .sessions
            .get_or_create(&instance)
            .await
            .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;

        let result = client
            .update_safe(&token, &safe_name, &safe)
            .await
            .map_err(vault_error_to_plane)?;

        Ok(Outcome::Completed(Some(result)))
    }
}

#[async_trait]
impl Handler for SafeDeleteHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::SafeDelete
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
        required_str(payload, "instance_id")?;
        required_str(payload, "safe_name")?;
        Ok(())
    }

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
        let instance_id = required_str(&op.payload, "instance_id")?;
        let safe_name = required_str(&op.payload, "safe_name")?;

        let instance = load_instance(&self.db, &instance_id).await?;
        let (client, token) = self
            .sessions
            .get_or_create(&instance)
            .await
            .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;

        client
            .delete_safe(&token, &safe_name)
            .await
            .map_err(vault_error_to_plane)?;

        tracing::info!(operation_id = %op.id, safe_name = %safe_name, "handler/safe-deleted");
        Ok(Outcome::Completed(None))
    }
}

#[async_trait]
impl Handler for AccessGrantHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::AccessGrant
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
        required_str(payload, "instance_id")?;
        required_str(payload, "safe_name")?;
        if payload.get("member").is_none() {
            return Err(PlaneError::Validation("payload missing required field 'member'".into()));
        }
        Ok(())
    }

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
        let instance_id = required_str(&op.payload, "instance_id")?;
        let safe_name = required_str(&op.payload, "safe_name")?;
        let member = op
            .payload
            .get("member")
            .cloned()
            .ok_or_else(|| PlaneError::Validation("payload missing required field 'member'".into()))?;

        let instance = load_instance(&self.db, &instance_id).await?;
        let (client, token) = self
            .sessions
            .get_or_create(&instance)
            .await
            .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;

        let result = client
            .grant_access(&token, &safe_name, &member)
            .await
            .map_err(vault_error_to_plane)?;

        Ok(Outcome::Completed(Some(result)))
    }
}

#[async_trait]
impl Handler for AccessRevokeHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::AccessRevoke
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
        required_str(payload, "instance_id")?;
        required_str(payload, "safe_name")?;
        required_str(payload, "member_name")?;
        Ok(())
    }

    async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
        let instance_id = required_str(&op.payload, "instance_id")?;
        let safe_name = required_str(&op.payload, "safe_name")?;
        let member_name = required_str(&op.payload, "member_name")?;

        let instance = load_instance(&self.db, &instance_id).await?;
        let (client, token) = self
            .sessions
            .get_or_create(&instance)
            .await
            .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;

        client
            .revoke_access(&token, &safe_name, &member_name)
            .await
            .map_err(vault_error_to_plane)?;

        Ok(Outcome::Completed(None))
    }
}

macro_rules! sync_handler {
    ($name:ident, $op_type:expr, $sync_type:expr, $run:expr) => {
        pub struct $name {
            db: PgPool,
            sessions: Arc<SessionCache>,
        }

        impl $name {
            pub fn new(db: PgPool, sessions: Arc<SessionCache>) -> Self {
                Self { db, sessions }
            }
        }

        #[async_trait]
        impl Handler for $name {
            fn operation_type(&self) -> OperationType {
                $op_type
            }

            fn validate_payload(&self, payload: &Value) -> Result<(), PlaneError> {
                required_str(payload, "instance_id")?;
                match payload.get("sync_mode").and_then(Value::as_str) {
                    Some("manual") | Some("scheduled") => Ok(()),
                    _ => Err(PlaneError::Validation(
                        "payload 'sync_mode' must be 'manual' or 'scheduled'".into(),
                    )),
                }
            }

            async fn handle(&self, op: &Operation) -> Result<Outcome, PlaneError> {
                let instance_id = required_str(&op.payload, "instance_id")?;
                let page_size = sync_page_size(&op.payload);
                let instance = load_instance(&self.db, &instance_id).await?;
                let cancel = pacp_sync::CancelSignal::new();

                let result = $run(&self.db, &self.sessions, &instance, page_size, &cancel).await?;
                let _ = $sync_type;

                tracing::info!(
                    operation_id = %op.id,
                    instance_id = %instance_id,
                    total_processed = result.total_processed,
                    deleted_count = result.deleted_count,
                    "handler/sync-completed"
                );

                let value = serde_json::to_value(&result).map_err(|e| {
                    PlaneError::Internal(format!("serialising sync result failed: {e}"))
                })?;
                Ok(Outcome::Completed(Some(value)))
            }
        }
    };
}

async fn run_user_sync(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &pacp_schemas::UpstreamInstance,
    page_size: u64,
    cancel: &pacp_sync::CancelSignal,
) -> Result<pacp_schemas::SyncResult, PlaneError> {
    pacp_sync::run_full_user_sync(db, sessions, instance, page_size, cancel).await
}

async fn run_safe_sync(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &pacp_schemas::UpstreamInstance,
    page_size: u64,
    cancel: &pacp_sync::CancelSignal,
) -> Result<pacp_schemas::SyncResult, PlaneError> {
    let (client, token) = sessions
        .get_or_create(instance)
        .await
        .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;
    let session = pacp_sync::Session { client, token };
    pacp_sync::sync_safes(db, sessions, instance, session, page_size, cancel).await
}

async fn run_group_sync(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &pacp_schemas::UpstreamInstance,
    page_size: u64,
    cancel: &pacp_sync::CancelSignal,
) -> Result<pacp_schemas::SyncResult, PlaneError> {
    let (client, token) = sessions
        .get_or_create(instance)
        .await
        .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;
    let session = pacp_sync::Session { client, token };
    pacp_sync::sync_groups(db, sessions, instance, session, page_size, cancel).await
}

sync_handler!(UserSyncHandler, OperationType::UserSync, SyncType::Users, run_user_sync);
sync_handler!(SafeSyncHandler, OperationType::SafeSync, SyncType::Safes, run_safe_sync);
sync_handler!(GroupSyncHandler, OperationType::GroupSync, SyncType::Groups, run_group_sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_falls_back_to_default_when_out_of_range() {
        assert_eq!(sync_page_size(&serde_json::json!({})), DEFAULT_SYNC_PAGE_SIZE);
        assert_eq!(sync_page_size(&serde_json::json!({"page_size": 0})), DEFAULT_SYNC_PAGE_SIZE);
        assert_eq!(sync_page_size(&serde_json::json!({"page_size": 5000})), DEFAULT_SYNC_PAGE_SIZE);
        assert_eq!(sync_page_size(&serde_json::json!({"page_size": 250})), 250);
    }

    #[test]
    fn required_str_rejects_a_missing_field() {
        let err = required_str(&serde_json::json!({}), "instance_id").unwrap_err();
        assert!(matches!(err, PlaneError::Validation(_)));
    }

    #[test]
    fn vault_error_classification_maps_onto_plane_error() {
        assert!(matches!(
            vault_error_to_plane(VaultError::AuthFailed("x".into())),
            PlaneError::AuthUpstream(_)
        ));
        assert!(matches!(
            vault_error_to_plane(VaultError::Retryable("x".into())),
            PlaneError::Transient(_)
        ));
        assert!(matches!(
            vault_error_to_plane(VaultError::Permanent("x".into())),
            PlaneError::Permanent(_)
        ));
    }
}
