//! Transactional store boundary.
//!
//! Every engine operation runs inside exactly one [`JobTx`]. Dropping a
//! transaction without calling [`JobTx::commit`] rolls it back, so an early `?`
//! return leaves no partial state behind.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edgepurge_auth::TenantDirectory;
use edgepurge_core::{
    CdnId, DeliveryServiceId, DeliveryServiceInfo, DeliveryServiceRef, JobId, JobRecord,
    PendingFlag, RevalidationScope, TenantId, TtlHours, UserId,
};

use crate::changelog::ChangeLogEntry;
use crate::jobs::query::{JobQuery, JobScope};

pub use in_memory::{InMemoryStore, StoreState};
pub use postgres::PostgresStore;

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Row to insert for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub asset_url: String,
    pub delivery_service_id: DeliveryServiceId,
    pub created_by_id: UserId,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: TtlHours,
    pub entered_time: DateTime<Utc>,
}

/// The mutable subset of a job.
#[derive(Debug, Clone)]
pub struct JobChanges {
    pub asset_url: String,
    pub ttl_hours: TtlHours,
    pub start_time: DateTime<Utc>,
}

/// Lock a user holds on a CDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnLock {
    pub cdn: CdnId,
    pub username: String,
    #[serde(default)]
    pub shared_usernames: Vec<String>,
}

impl CdnLock {
    /// Whether this lock stops `username` from changing the CDN.
    pub fn blocks(&self, username: &str) -> bool {
        self.username != username && !self.shared_usernames.iter().any(|u| u == username)
    }
}

/// Opens transactions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn JobTx>, StoreError>;
}

/// One open transaction.
///
/// Tenant lookups come from the [`TenantDirectory`] supertrait so the
/// authorization gate runs inside the same transaction as the mutation.
#[async_trait]
pub trait JobTx: TenantDirectory<Error = StoreError> {
    async fn delivery_service(
        &mut self,
        reference: &DeliveryServiceRef,
    ) -> Result<Option<DeliveryServiceInfo>, StoreError>;

    /// The acting tenant and all of its descendants.
    async fn accessible_tenants(&mut self, acting: TenantId) -> Result<Vec<TenantId>, StoreError>;

    /// Global configuration parameter lookup.
    async fn parameter(&mut self, name: &str, config_file: &str) -> Result<Option<String>, StoreError>;

    async fn cdn_lock(&mut self, cdn: CdnId) -> Result<Option<CdnLock>, StoreError>;

    async fn job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    async fn jobs_for_delivery_service(
        &mut self,
        ds: DeliveryServiceId,
    ) -> Result<Vec<JobRecord>, StoreError>;

    async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord, StoreError>;

    /// Apply `changes`; `now` becomes the row's last-modified time.
    async fn update_job(
        &mut self,
        id: JobId,
        changes: JobChanges,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError>;

    /// Remove a job and record a tombstone stamped `now`.
    async fn delete_job(&mut self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError>;

    async fn list_jobs(&mut self, scope: &JobScope, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError>;

    /// Newest modification among matching live jobs and job tombstones.
    async fn jobs_last_modified(
        &mut self,
        scope: &JobScope,
        query: &JobQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Set `flag` on every eligible fleet member of the scoped delivery service's CDN.
    async fn mark_fleet(&mut self, scope: &RevalidationScope, flag: PendingFlag) -> Result<u64, StoreError>;

    async fn append_change_log(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
