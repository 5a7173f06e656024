use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync_job::SyncType;

/// Upstream vault configuration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInstance {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub username: String,
    /// Encrypted at rest; encryption-at-rest itself is out of scope (spec
    /// §1) — this field is an opaque ciphertext blob the Session Cache
    /// hands to a decryption boundary it does not own.
    pub encrypted_password: String,
    pub skip_tls_verify: bool,
    pub is_active: bool,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_test_success: Option<bool>,
    pub last_test_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per (upstream_instance_id, sync_type) schedule configuration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSyncConfig {
    pub upstream_instance_id: String,
    pub sync_type: SyncType,
    pub enabled: bool,
    pub interval_minutes: i32,
    pub page_size: i32,
    pub retry_attempts: i32,
    pub timeout_minutes: i32,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl InstanceSyncConfig {
    pub const MIN_INTERVAL_MINUTES: i32 = 5;
    pub const MAX_RETRY_ATTEMPTS: i32 = 10;
    pub const MIN_PAGE_SIZE: i32 = 1;
    pub const MAX_PAGE_SIZE: i32 = 1000;
    pub const MIN_TIMEOUT_MINUTES: i32 = 1;
    pub const MAX_TIMEOUT_MINUTES: i32 = 120;

    /// Validate the boundary rules from spec §8 ("boundary behaviours").
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_minutes < Self::MIN_INTERVAL_MINUTES {
            return Err(format!(
                "interval_minutes must be >= {}",
                Self::MIN_INTERVAL_MINUTES
            ));
        }
        if self.retry_attempts < 0 || self.retry_attempts > Self::MAX_RETRY_ATTEMPTS {
            return Err(format!(
                "retry_attempts must be in 0..={}",
                Self::MAX_RETRY_ATTEMPTS
            ));
        }
        if self.page_size < Self::MIN_PAGE_SIZE || self.page_size > Self::MAX_PAGE_SIZE {
            return Err(format!(
                "page_size must be in {}..={}",
                Self::MIN_PAGE_SIZE,
                Self::MAX_PAGE_SIZE
            ));
        }
        if self.timeout_minutes < Self::MIN_TIMEOUT_MINUTES
            || self.timeout_minutes > Self::MAX_TIMEOUT_MINUTES
        {
            return Err(format!(
                "timeout_minutes must be in {}..={}",
                Self::MIN_TIMEOUT_MINUTES,
                Self::MAX_TIMEOUT_MINUTES
            ));
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(last) => now >= last + chrono::Duration::minutes(self.interval_minutes as i64),
        }
    }
}
