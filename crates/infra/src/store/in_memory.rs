//! In-memory store.
//!
//! The whole state sits behind one async mutex. A transaction holds the lock for
//! its lifetime and mutates a private working copy; `commit` swaps the copy in,
//! dropping the transaction discards it. Requests are therefore serialized,
//! which is acceptable for tests and single-node demos.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use edgepurge_auth::{AuthTarget, TenantDirectory, TenantHierarchy};
use edgepurge_core::{
    CdnId, DeliveryServiceId, DeliveryServiceInfo, DeliveryServiceRef, JobId, JobRecord,
    PendingFlag, RevalidationScope, ServerId, ServerStatus, TenantId, TtlHours, UserId,
};

use super::{CdnLock, JobChanges, JobStore, JobTx, NewJob, StoreError};
use crate::changelog::ChangeLogEntry;
use crate::jobs::query::{JobQuery, JobScope};

/// Tombstone table name for deleted jobs.
pub const JOB_TABLE: &str = "job";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRow {
    pub id: ServerId,
    pub host_name: String,
    pub cdn_id: CdnId,
    pub status: ServerStatus,
    /// Profile carries the `location` parameter for the revalidation config file.
    #[serde(default = "yes")]
    pub watches_revalidation: bool,
    #[serde(default)]
    pub upd_pending: bool,
    #[serde(default)]
    pub reval_pending: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub name: String,
    pub config_file: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub asset_url: String,
    pub delivery_service_id: DeliveryServiceId,
    pub created_by_id: UserId,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: TtlHours,
    pub entered_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub table_name: String,
    pub last_updated: DateTime<Utc>,
}

/// Everything the in-memory store holds. Deserializable so fixtures can seed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub tenants: TenantHierarchy,
    pub users: Vec<UserRow>,
    pub delivery_services: Vec<DeliveryServiceInfo>,
    pub cdn_locks: Vec<CdnLock>,
    pub servers: Vec<ServerRow>,
    pub parameters: Vec<ParameterRow>,
    pub jobs: Vec<JobRow>,
    pub tombstones: Vec<Tombstone>,
    pub change_log: Vec<ChangeLogEntry>,
    next_job_id: i64,
}

impl StoreState {
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Set or replace a global parameter.
    pub fn set_parameter(&mut self, name: &str, config_file: &str, value: &str) {
        self.parameters
            .retain(|p| !(p.name == name && p.config_file == config_file));
        self.parameters.push(ParameterRow {
            name: name.to_string(),
            config_file: config_file.to_string(),
            value: value.to_string(),
        });
    }

    pub fn server(&self, host_name: &str) -> Option<&ServerRow> {
        self.servers.iter().find(|s| s.host_name == host_name)
    }

    fn ds_by_ref(&self, reference: &DeliveryServiceRef) -> Option<&DeliveryServiceInfo> {
        self.delivery_services.iter().find(|ds| reference.refers_to(ds))
    }

    fn ds_by_id(&self, id: DeliveryServiceId) -> Option<&DeliveryServiceInfo> {
        self.delivery_services.iter().find(|ds| ds.id == id)
    }

    fn hydrate(&self, row: &JobRow) -> Result<JobRecord, StoreError> {
        let ds = self.ds_by_id(row.delivery_service_id).ok_or_else(|| {
            StoreError::Database(format!(
                "job {} references missing deliveryservice {}",
                row.id, row.delivery_service_id
            ))
        })?;
        let user = self
            .users
            .iter()
            .find(|u| u.id == row.created_by_id)
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "job {} references missing user {}",
                    row.id, row.created_by_id
                ))
            })?;
        Ok(JobRecord {
            id: row.id,
            asset_url: row.asset_url.clone(),
            delivery_service_id: ds.id,
            delivery_service: ds.xml_id.clone(),
            created_by_id: user.id,
            created_by: user.username.clone(),
            start_time: row.start_time,
            ttl_hours: row.ttl_hours,
            entered_time: row.entered_time,
            last_updated: row.last_updated,
        })
    }

    /// Visible jobs with the delivery service each belongs to.
    fn scoped_jobs(&self, scope: &JobScope, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut out = Vec::new();
        for row in &self.jobs {
            let Some(ds) = self.ds_by_id(row.delivery_service_id) else {
                continue;
            };
            if query.cdn.as_ref().is_some_and(|cdn| *cdn != ds.cdn_name) {
                continue;
            }
            let job = self.hydrate(row)?;
            if scope.admits(ds.tenant_id, &job) && query.matches(&job) {
                out.push(job);
            }
        }
        Ok(out)
    }
}

/// Mutex-guarded in-memory [`JobStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new(state: StoreState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Committed state, for inspection.
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    /// Mutate committed state directly, outside any engine transaction.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self.state.lock().await;
        f(&mut guard)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn JobTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(InMemoryTx { guard, work }))
    }
}

/// Open in-memory transaction.
pub struct InMemoryTx {
    guard: OwnedMutexGuard<StoreState>,
    work: StoreState,
}

#[async_trait]
impl TenantDirectory for InMemoryTx {
    type Error = StoreError;

    async fn owning_tenant(&mut self, target: &AuthTarget) -> Result<Option<TenantId>, StoreError> {
        let s = &self.work;
        Ok(match target {
            AuthTarget::DeliveryServiceId(id) => s.ds_by_id(*id).map(|ds| ds.tenant_id),
            AuthTarget::DeliveryServiceName(name) => s
                .delivery_services
                .iter()
                .find(|ds| ds.xml_id == *name)
                .map(|ds| ds.tenant_id),
            AuthTarget::UserId(id) => s.users.iter().find(|u| u.id == *id).map(|u| u.tenant_id),
            AuthTarget::Username(name) => s
                .users
                .iter()
                .find(|u| u.username == *name)
                .map(|u| u.tenant_id),
        })
    }

    async fn tenant_in_subtree(
        &mut self,
        acting: TenantId,
        target: TenantId,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self.work.tenants.subtree_status(acting, target))
    }
}

#[async_trait]
impl JobTx for InMemoryTx {
    async fn delivery_service(
        &mut self,
        reference: &DeliveryServiceRef,
    ) -> Result<Option<DeliveryServiceInfo>, StoreError> {
        Ok(self.work.ds_by_ref(reference).cloned())
    }

    async fn accessible_tenants(&mut self, acting: TenantId) -> Result<Vec<TenantId>, StoreError> {
        let tenants = &self.work.tenants;
        Ok(tenants
            .descendants_or_self(acting)
            .into_iter()
            .filter(|id| tenants.get(*id).is_some_and(|t| t.active))
            .collect())
    }

    async fn parameter(&mut self, name: &str, config_file: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .work
            .parameters
            .iter()
            .find(|p| p.name == name && p.config_file == config_file)
            .map(|p| p.value.clone()))
    }

    async fn cdn_lock(&mut self, cdn: CdnId) -> Result<Option<CdnLock>, StoreError> {
        Ok(self.work.cdn_locks.iter().find(|l| l.cdn == cdn).cloned())
    }

    async fn job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.work
            .jobs
            .iter()
            .find(|j| j.id == id)
            .map(|row| self.work.hydrate(row))
            .transpose()
    }

    async fn jobs_for_delivery_service(
        &mut self,
        ds: DeliveryServiceId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.work
            .jobs
            .iter()
            .filter(|j| j.delivery_service_id == ds)
            .map(|row| self.work.hydrate(row))
            .collect()
    }

    async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord, StoreError> {
        let max_existing = self.work.jobs.iter().map(|j| j.id.get()).max().unwrap_or(0);
        let id = JobId::new(self.work.next_job_id.max(max_existing + 1));
        self.work.next_job_id = id.get() + 1;

        let row = JobRow {
            id,
            asset_url: job.asset_url,
            delivery_service_id: job.delivery_service_id,
            created_by_id: job.created_by_id,
            start_time: job.start_time,
            ttl_hours: job.ttl_hours,
            entered_time: job.entered_time,
            last_updated: job.entered_time,
        };
        let record = self.work.hydrate(&row)?;
        self.work.jobs.push(row);
        Ok(record)
    }

    async fn update_job(
        &mut self,
        id: JobId,
        changes: JobChanges,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let row = self
            .work
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::Database(format!("job {id} vanished during update")))?;
        row.asset_url = changes.asset_url;
        row.ttl_hours = changes.ttl_hours;
        row.start_time = changes.start_time;
        row.last_updated = now;
        let row = row.clone();
        self.work.hydrate(&row)
    }

    async fn delete_job(&mut self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError> {
        let Some(pos) = self.work.jobs.iter().position(|j| j.id == id) else {
            return Ok(None);
        };
        let record = self.work.hydrate(&self.work.jobs[pos])?;
        self.work.jobs.remove(pos);

        match self.work.tombstones.iter_mut().find(|t| t.table_name == JOB_TABLE) {
            Some(t) => t.last_updated = t.last_updated.max(now),
            None => self.work.tombstones.push(Tombstone {
                table_name: JOB_TABLE.to_string(),
                last_updated: now,
            }),
        }
        Ok(Some(record))
    }

    async fn list_jobs(&mut self, scope: &JobScope, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.work.scoped_jobs(scope, query)?;
        Ok(query.order_and_page(jobs))
    }

    async fn jobs_last_modified(
        &mut self,
        scope: &JobScope,
        query: &JobQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let live = self
            .work
            .scoped_jobs(scope, query)?
            .into_iter()
            .map(|j| j.last_updated)
            .max();
        let deleted = self
            .work
            .tombstones
            .iter()
            .filter(|t| t.table_name == JOB_TABLE)
            .map(|t| t.last_updated)
            .max();
        Ok(live.max(deleted))
    }

    async fn mark_fleet(&mut self, scope: &RevalidationScope, flag: PendingFlag) -> Result<u64, StoreError> {
        let ds = match scope {
            RevalidationScope::ById(id) => self.work.ds_by_id(*id),
            RevalidationScope::ByName(name) => {
                self.work.delivery_services.iter().find(|ds| ds.xml_id == *name)
            }
        };
        let Some(cdn) = ds.map(|ds| ds.cdn_id) else {
            return Ok(0);
        };

        let mut marked = 0;
        for server in self.work.servers.iter_mut().filter(|s| {
            s.cdn_id == cdn && s.watches_revalidation && !s.status.skips_revalidation()
        }) {
            match flag {
                PendingFlag::RevalPending => server.reval_pending = true,
                PendingFlag::UpdPending => server.upd_pending = true,
            }
            marked += 1;
        }
        Ok(marked)
    }

    async fn append_change_log(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        self.work.change_log.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}
