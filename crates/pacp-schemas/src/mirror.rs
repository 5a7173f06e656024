use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per upstream user, scoped by (upstream_instance_id, vendor user
/// id) (spec §3). Tombstoned rather than deleted on disappearance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorUser {
    pub id: String,
    pub upstream_instance_id: String,
    pub vendor_user_id: String,
    pub username: String,
    pub user_type: String,
    pub suspended: bool,
    pub enable_user: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields derived from a vendor user payload, used for both insert and
/// update in the upsert step of the sync algorithm (spec §4.7 step 6).
/// Absent personal-details fields map to `None`, clearing stale values on
/// update rather than leaving them as-is (spec §4.7 edge cases).
#[derive(Debug, Clone)]
pub struct MirrorUserFields {
    pub username: String,
    pub user_type: String,
    pub suspended: bool,
    pub enable_user: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorGroupMembership {
    pub id: String,
    pub upstream_instance_id: String,
    pub vendor_user_id: String,
    pub vendor_group_id: String,
    pub username: String,
    pub group_name: String,
    pub group_type: String,
    pub last_synced_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorVaultAuthorization {
    pub id: String,
    pub upstream_instance_id: String,
    pub vendor_user_id: String,
    pub authorization_string: String,
    pub last_synced_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}
