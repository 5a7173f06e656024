//! Shared wire/persistence types for the privileged-access control plane.
//!
//! No I/O lives here — just the data model from the spec's data-model
//! section, plus the error taxonomy that crosses every component boundary.

pub mod ca;
pub mod error;
pub mod ids;
pub mod instance;
pub mod mirror;
pub mod operation;
pub mod pipeline_config;
pub mod session;
pub mod sync_job;

pub use ca::{CertificateAuthority, ChainCertInfo};
pub use error::PlaneError;
pub use ids::new_id;
pub use instance::{InstanceSyncConfig, UpstreamInstance};
pub use mirror::{MirrorGroupMembership, MirrorUser, MirrorUserFields, MirrorVaultAuthorization};
pub use operation::{
    HourlyBucket, Operation, OperationFilters, OperationStats, OperationStatus, OperationType,
    Outcome, Page, Priority, SortField, SortOrder,
};
pub use pipeline_config::{OperationTimeouts, PipelineConfig, ProcessingCapacity, RetryPolicy};
pub use session::ApiSession;
pub use sync_job::{SyncJob, SyncResult, SyncType, TriggeredBy};
