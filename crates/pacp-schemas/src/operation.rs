use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of queued work (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SafeProvision,
    SafeModify,
    SafeDelete,
    AccessGrant,
    AccessRevoke,
    UserSync,
    SafeSync,
    GroupSync,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::SafeProvision => "safe_provision",
            OperationType::SafeModify => "safe_modify",
            OperationType::SafeDelete => "safe_delete",
            OperationType::AccessGrant => "access_grant",
            OperationType::AccessRevoke => "access_revoke",
            OperationType::UserSync => "user_sync",
            OperationType::SafeSync => "safe_sync",
            OperationType::GroupSync => "group_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "safe_provision" => OperationType::SafeProvision,
            "safe_modify" => OperationType::SafeModify,
            "safe_delete" => OperationType::SafeDelete,
            "access_grant" => OperationType::AccessGrant,
            "access_revoke" => OperationType::AccessRevoke,
            "user_sync" => OperationType::UserSync,
            "safe_sync" => OperationType::SafeSync,
            "group_sync" => OperationType::GroupSync,
            _ => return None,
        })
    }

    /// Whether this type is one of the three sync flavours (spec §4.7).
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            OperationType::UserSync | OperationType::SafeSync | OperationType::GroupSync
        )
    }
}

/// Priority lane (spec §3). All four are accepted in storage; whether
/// `Medium` participates in a given allocation is a property of the
/// configured `PriorityAllocation`, not of this enum (spec §9 open
/// question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "low" => Priority::Low,
            "normal" => Priority::Normal,
            "medium" => Priority::Medium,
            "high" => Priority::High,
            _ => return None,
        })
    }

    pub fn all() -> [Priority; 4] {
        [Priority::High, Priority::Medium, Priority::Normal, Priority::Low]
    }
}

/// Operation lifecycle status (spec §3/§4.5 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => OperationStatus::Pending,
            "processing" => OperationStatus::Processing,
            "completed" => OperationStatus::Completed,
            "failed" => OperationStatus::Failed,
            "cancelled" => OperationStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// A unit of queued work (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub priority: Priority,
    pub status: OperationStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub upstream_instance_id: Option<String>,
    pub correlation_id: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome a handler produces and the Scheduler translates into a Store
/// `finalise` call (spec §4.1, §4.5).
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Option<Value>),
    Failed(String),
    RetryAfter {
        delay: chrono::Duration,
        error: String,
    },
    Cancelled,
}

/// Filters accepted by `list_operations` / `count_operations` (spec §4.1,
/// §6). `sort_by` is validated against a fixed whitelist by the Store, not
/// interpolated directly into SQL.
#[derive(Debug, Clone, Default)]
pub struct OperationFilters {
    pub status: Option<OperationStatus>,
    pub operation_type: Option<OperationType>,
    pub priority: Option<Priority>,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    pub upstream_instance_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    ScheduledAt,
    Priority,
    Status,
}

impl SortField {
    /// Fixed whitelist preventing SQL injection through `sort_by` (spec §4.1).
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created_at" => SortField::CreatedAt,
            "updated_at" => SortField::UpdatedAt,
            "scheduled_at" => SortField::ScheduledAt,
            "priority" => SortField::Priority,
            "status" => SortField::Status,
            _ => return None,
        })
    }

    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::ScheduledAt => "scheduled_at",
            SortField::Priority => "priority",
            SortField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }
}

/// Aggregated stats over a date range (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OperationStats {
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub by_type: std::collections::BTreeMap<String, i64>,
    pub by_priority: std::collections::BTreeMap<String, i64>,
    pub hourly_histogram: Vec<HourlyBucket>,
    pub avg_wait_seconds: Option<f64>,
    pub avg_process_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub count: i64,
}
