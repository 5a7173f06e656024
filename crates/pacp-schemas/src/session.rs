use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API (HTTP-boundary) session — distinct from the upstream vault session
/// the Session Cache owns in-memory (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSession {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}
