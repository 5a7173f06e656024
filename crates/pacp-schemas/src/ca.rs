use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parsed metadata about a stored CA's leaf certificate (spec §3). Chains
/// (intermediate + root) are stored as one PEM blob; `chain_info` carries
/// one entry per certificate found in the chain, ordered as uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub id: String,
    pub name: String,
    /// Hex-encoded SHA-256 over the first (primary) certificate in the PEM.
    pub fingerprint: String,
    pub pem: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_root: bool,
    pub is_intermediate: bool,
    pub chain_info: Vec<ChainCertInfo>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainCertInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}
