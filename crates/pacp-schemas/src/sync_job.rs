use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::OperationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Users,
    Groups,
    Safes,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Users => "users",
            SyncType::Groups => "groups",
            SyncType::Safes => "safes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "users" => SyncType::Users,
            "groups" => SyncType::Groups,
            "safes" => SyncType::Safes,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Scheduled => "scheduled",
        }
    }
}

/// Execution record of a sync operation (spec §3) — distinct from
/// `Operation` because it carries aggregated counters and is observable
/// independently via the Activity View.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub upstream_instance_id: String,
    pub sync_type: SyncType,
    pub triggered_by: TriggeredBy,
    pub status: OperationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub records_synced: i64,
    pub error_message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result payload produced by the sync handler and stored on the parent
/// `Operation.result` (spec §4.7 step 9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub total_processed: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub deleted_count: i64,
    pub errors: Vec<String>,
}
