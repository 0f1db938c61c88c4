//! `edgepurge-core`: domain foundation for content invalidation jobs.
//!
//! This crate contains **pure domain** logic (no storage, no transport).

pub mod conflict;
pub mod delivery_service;
pub mod entity;
pub mod error;
pub mod fleet;
pub mod id;
pub mod job;
pub mod value_object;

pub use conflict::{CandidateWindow, JobConflict, find_conflicts, paths_overlap};
pub use delivery_service::{DeliveryServiceInfo, DeliveryServiceRef, Origin};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use fleet::{
    GLOBAL_CONFIG_FILE, MAX_REVAL_DURATION_DAYS_PARAMETER, PendingFlag, REVALIDATE_CONFIG_FILE,
    RevalidationScope, ServerStatus, USE_REVAL_PENDING_PARAMETER,
};
pub use id::{CdnId, DeliveryServiceId, JobId, ServerId, TenantId, UserId};
pub use job::{
    INVALIDATION_TYPE_REFRESH, InvalidationJob, JOB_KEYWORD, JobRecord, JobState, TtlHours,
};
pub use value_object::ValueObject;
