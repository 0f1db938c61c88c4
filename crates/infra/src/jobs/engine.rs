//! Invalidation job orchestration.
//!
//! Every public operation opens exactly one store transaction and runs its steps
//! sequentially inside it:
//!
//! ```text
//! tenant gate -> CDN lock -> validation -> conflict scan (advisory)
//!   -> mutation -> fleet flag propagation -> change log -> commit
//! ```
//!
//! Any failure returns before `commit`, and dropping the transaction rolls it
//! back. A job therefore never exists without its fleet having been marked.
//!
//! Callers pass `now` explicitly so lifecycle checks are deterministic under test.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use edgepurge_auth::{AuthTarget, Principal, authorize_target};
use edgepurge_core::{
    CandidateWindow, DeliveryServiceInfo, DeliveryServiceRef, DomainError, DomainResult, InvalidationJob,
    JobConflict, JobId, JobRecord, MAX_REVAL_DURATION_DAYS_PARAMETER, REVALIDATE_CONFIG_FILE,
    RevalidationScope, TtlHours, find_conflicts,
};

use crate::changelog::{ChangeLogEntry, JobAction, job_message};
use crate::jobs::query::{JobQuery, JobScope};
use crate::jobs::revalidation::propagate;
use crate::store::{JobChanges, JobStore, JobTx, NewJob, StoreError};

/// Engine error: a classified business failure or a store failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Largest `maxRevalDurationDays` whose hour ceiling still fits a TTL.
const MAX_REVAL_DAYS: i64 = TtlHours::MAX_HOURS / 24;

/// Settings fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Recency window and TTL ceiling when `maxRevalDurationDays` is not configured.
    pub default_recency_days: i64,
    /// How far in the future a job may be scheduled to start.
    pub max_start_lead: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_recency_days: 90,
            max_start_lead: Duration::days(2),
        }
    }
}

/// Create payload after transport-level decoding.
#[derive(Debug, Clone)]
pub struct NewJobRequest {
    pub delivery_service: DeliveryServiceRef,
    /// Path fragment (`/...`) or a full URL under the delivery service's origin.
    pub asset_url: String,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: i64,
}

/// Replace payload.
///
/// Fields stay optional so that a started job is rejected before anything in
/// the payload is looked at. Identity fields must match the stored job.
#[derive(Debug, Clone, Default)]
pub struct ReplaceJobRequest {
    pub id: Option<JobId>,
    pub delivery_service: Option<DeliveryServiceRef>,
    pub created_by: Option<String>,
    pub asset_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub ttl_hours: Option<i64>,
    /// Legacy `TTL:<n>h` form; ignored when `ttl_hours` is present.
    pub parameters: Option<String>,
}

impl ReplaceJobRequest {
    fn ttl(&self) -> Result<TtlHours, DomainError> {
        match (self.ttl_hours, self.parameters.as_deref()) {
            (Some(hours), _) => TtlHours::new(hours),
            (None, Some(parameters)) => TtlHours::from_parameters(parameters),
            (None, None) => Err(DomainError::validation("ttlHours: cannot be blank")),
        }
    }

    /// Identity fields must be present and equal to the stored job's.
    fn check_identity(&self, current: &JobRecord) -> Result<(), DomainError> {
        let id = self.id.ok_or_else(|| DomainError::validation("id: cannot be blank"))?;
        if id != current.id {
            return Err(DomainError::immutable("id"));
        }

        let ds = self
            .delivery_service
            .as_ref()
            .ok_or_else(|| DomainError::validation("deliveryService: cannot be blank"))?;
        let same_ds = match ds {
            DeliveryServiceRef::Id(ds) => *ds == current.delivery_service_id,
            DeliveryServiceRef::Name(name) => *name == current.delivery_service,
        };
        if !same_ds {
            return Err(DomainError::immutable("deliveryService"));
        }

        let created_by = self
            .created_by
            .as_deref()
            .ok_or_else(|| DomainError::validation("createdBy: cannot be blank"))?;
        if created_by != current.created_by {
            return Err(DomainError::immutable("createdBy"));
        }
        Ok(())
    }
}

/// Result of a successful Create or Replace.
#[derive(Debug, Clone)]
pub struct JobMutation {
    pub record: JobRecord,
    /// Advisory overlaps with other jobs of the same delivery service.
    pub conflicts: Vec<JobConflict>,
}

impl JobMutation {
    pub fn view(&self) -> InvalidationJob {
        self.record.to_view()
    }
}

/// Result of a listing.
#[derive(Debug, Clone)]
pub enum ListOutcome {
    /// The caller's copy is current; no rows were read.
    NotModified { last_modified: DateTime<Utc> },
    Jobs {
        jobs: Vec<InvalidationJob>,
        last_modified: Option<DateTime<Utc>>,
    },
}

/// Job engine. Constructed once at startup and shared.
#[derive(Clone)]
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    settings: EngineSettings,
}

impl JobEngine {
    pub fn new(store: Arc<dyn JobStore>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Tenant-scoped listing with conditional-read short-circuit.
    #[instrument(skip(self, principal, query), fields(user = %principal.username), err)]
    pub async fn list(
        &self,
        principal: &Principal,
        query: &JobQuery,
        if_modified_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<ListOutcome> {
        let mut tx = self.store.begin().await?;

        let tenants = tx.accessible_tenants(principal.tenant_id).await?;
        let started_after = if query.recent_only {
            let days = self.max_reval_days(tx.as_mut()).await?;
            Duration::try_days(days).and_then(|window| now.checked_sub_signed(window))
        } else {
            None
        };
        let scope = JobScope { tenants, started_after };

        // Exact timestamp: a second-resolution cutoff must not hide a later change in the same second.
        let last_modified = tx.jobs_last_modified(&scope, query).await?;

        if let (Some(cutoff), Some(last)) = (if_modified_since, last_modified) {
            if cutoff >= last {
                tracing::debug!(%cutoff, %last, "conditional read hit");
                tx.commit().await?;
                return Ok(ListOutcome::NotModified { last_modified: last });
            }
            tracing::debug!(%cutoff, %last, "conditional read miss");
        }

        let jobs = tx.list_jobs(&scope, query).await?;
        tx.commit().await?;

        Ok(ListOutcome::Jobs {
            jobs: jobs.iter().map(JobRecord::to_view).collect(),
            last_modified,
        })
    }

    #[instrument(
        skip(self, principal, request),
        fields(user = %principal.username, ds = %request.delivery_service),
        err
    )]
    pub async fn create(
        &self,
        principal: &Principal,
        request: NewJobRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<JobMutation> {
        let ttl = TtlHours::new(request.ttl_hours)?;
        self.check_start_time(request.start_time, now)?;

        let mut tx = self.store.begin().await?;

        let ds = tx
            .delivery_service(&request.delivery_service)
            .await?
            .ok_or_else(no_such_delivery_service)?;
        if !authorize_target(tx.as_mut(), principal.tenant_id, &AuthTarget::DeliveryServiceId(ds.id)).await? {
            return Err(no_such_delivery_service().into());
        }
        check_cdn_lock(tx.as_mut(), &ds, principal).await?;

        let asset_url = ds.primary_origin()?.asset_url(&request.asset_url)?;
        self.check_ttl_ceiling(tx.as_mut(), ttl).await?;

        let existing = tx.jobs_for_delivery_service(ds.id).await?;
        let conflicts = find_conflicts(
            &CandidateWindow {
                asset_url: &asset_url,
                start_time: request.start_time,
                ttl_hours: ttl,
                replacing: None,
            },
            &existing,
        );

        let record = tx
            .insert_job(NewJob {
                asset_url,
                delivery_service_id: ds.id,
                created_by_id: principal.user_id,
                start_time: request.start_time,
                ttl_hours: ttl,
                entered_time: now,
            })
            .await?;

        propagate(tx.as_mut(), &RevalidationScope::ById(ds.id)).await?;
        record_change(tx.as_mut(), JobAction::Created, &record, !conflicts.is_empty(), principal, now).await?;
        tx.commit().await?;

        tracing::info!(job_id = %record.id, conflicts = conflicts.len(), "invalidation job created");
        Ok(JobMutation { record, conflicts })
    }

    pub async fn replace(
        &self,
        principal: &Principal,
        id: JobId,
        request: ReplaceJobRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<JobMutation> {
        self.replace_with(principal, id, move || Ok(request), now).await
    }

    /// Replace with a payload decoded only once the job is known to be visible and mutable.
    #[instrument(skip(self, principal, decode), fields(user = %principal.username, job_id = %id), err)]
    pub async fn replace_with<F>(
        &self,
        principal: &Principal,
        id: JobId,
        decode: F,
        now: DateTime<Utc>,
    ) -> EngineResult<JobMutation>
    where
        F: FnOnce() -> DomainResult<ReplaceJobRequest> + Send,
    {
        let mut tx = self.store.begin().await?;

        let current = tx.job(id).await?.ok_or_else(|| no_such_job(id))?;
        authorize_job(tx.as_mut(), principal, &current, AuthTarget::Username(current.created_by.clone())).await?;

        // An active job is immutable whatever the payload says.
        current.ensure_mutable(now)?;

        let request = decode()?;
        request.check_identity(&current)?;

        let ttl = request.ttl()?;
        let start_time = request
            .start_time
            .ok_or_else(|| DomainError::validation("startTime: cannot be blank"))?;
        self.check_start_time(start_time, now)?;
        let requested_url = request
            .asset_url
            .as_deref()
            .ok_or_else(|| DomainError::validation("assetUrl: cannot be blank"))?;

        let ds = tx
            .delivery_service(&DeliveryServiceRef::Id(current.delivery_service_id))
            .await?
            .ok_or_else(|| no_such_job(id))?;
        check_cdn_lock(tx.as_mut(), &ds, principal).await?;

        let asset_url = ds.primary_origin()?.asset_url(requested_url)?;
        self.check_ttl_ceiling(tx.as_mut(), ttl).await?;

        let existing = tx.jobs_for_delivery_service(ds.id).await?;
        let conflicts = find_conflicts(
            &CandidateWindow {
                asset_url: &asset_url,
                start_time,
                ttl_hours: ttl,
                replacing: Some(id),
            },
            &existing,
        );

        let record = tx
            .update_job(
                id,
                JobChanges {
                    asset_url,
                    ttl_hours: ttl,
                    start_time,
                },
                now,
            )
            .await?;

        propagate(tx.as_mut(), &RevalidationScope::ByName(ds.xml_id.clone())).await?;
        record_change(tx.as_mut(), JobAction::Updated, &record, !conflicts.is_empty(), principal, now).await?;
        tx.commit().await?;

        tracing::info!(conflicts = conflicts.len(), "invalidation job replaced");
        Ok(JobMutation { record, conflicts })
    }

    /// Delete at any lifecycle point. Leaves a tombstone for conditional reads.
    #[instrument(skip(self, principal), fields(user = %principal.username, job_id = %id), err)]
    pub async fn delete(
        &self,
        principal: &Principal,
        id: JobId,
        now: DateTime<Utc>,
    ) -> EngineResult<InvalidationJob> {
        let mut tx = self.store.begin().await?;

        let current = tx.job(id).await?.ok_or_else(|| no_such_job(id))?;
        authorize_job(tx.as_mut(), principal, &current, AuthTarget::UserId(current.created_by_id)).await?;

        let ds = tx
            .delivery_service(&DeliveryServiceRef::Id(current.delivery_service_id))
            .await?
            .ok_or_else(|| no_such_job(id))?;
        check_cdn_lock(tx.as_mut(), &ds, principal).await?;

        let removed = tx.delete_job(id, now).await?.ok_or_else(|| no_such_job(id))?;

        propagate(tx.as_mut(), &RevalidationScope::ById(removed.delivery_service_id)).await?;
        record_change(tx.as_mut(), JobAction::Deleted, &removed, false, principal, now).await?;
        tx.commit().await?;

        tracing::info!("invalidation job deleted");
        Ok(removed.to_view())
    }

    fn check_start_time(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), DomainError> {
        if start < now {
            return Err(DomainError::validation("startTime: cannot be in the past"));
        }
        if start > now + self.settings.max_start_lead {
            return Err(DomainError::validation(format!(
                "startTime: must be within {} days from now",
                self.settings.max_start_lead.num_days()
            )));
        }
        Ok(())
    }

    async fn check_ttl_ceiling(&self, tx: &mut dyn JobTx, ttl: TtlHours) -> EngineResult<()> {
        let max_hours = self.max_reval_days(tx).await?.saturating_mul(24);
        if i64::from(ttl.get()) > max_hours {
            return Err(DomainError::validation(format!(
                "ttlHours: cannot exceed {max_hours} hours ({MAX_REVAL_DURATION_DAYS_PARAMETER})"
            ))
            .into());
        }
        Ok(())
    }

    async fn max_reval_days(&self, tx: &mut dyn JobTx) -> EngineResult<i64> {
        let raw = tx
            .parameter(MAX_REVAL_DURATION_DAYS_PARAMETER, REVALIDATE_CONFIG_FILE)
            .await?;
        Ok(match raw.as_deref().map(str::trim).map(str::parse::<i64>) {
            Some(Ok(days)) if (1..=MAX_REVAL_DAYS).contains(&days) => days,
            Some(_) => {
                tracing::warn!(value = ?raw, "ignoring malformed or out-of-range {MAX_REVAL_DURATION_DAYS_PARAMETER} parameter");
                self.settings.default_recency_days
            }
            None => self.settings.default_recency_days,
        })
    }
}

fn no_such_delivery_service() -> DomainError {
    DomainError::not_found("No such Delivery Service!")
}

fn no_such_job(id: JobId) -> DomainError {
    DomainError::not_found(format!("No job by id '{id}'!"))
}

/// Mutations need visibility of both the job's delivery service and its creator.
async fn authorize_job(
    tx: &mut dyn JobTx,
    principal: &Principal,
    job: &JobRecord,
    creator: AuthTarget,
) -> EngineResult<()> {
    let ds = AuthTarget::DeliveryServiceId(job.delivery_service_id);
    if !authorize_target(&mut *tx, principal.tenant_id, &ds).await?
        || !authorize_target(&mut *tx, principal.tenant_id, &creator).await?
    {
        return Err(no_such_job(job.id).into());
    }
    Ok(())
}

async fn check_cdn_lock(
    tx: &mut dyn JobTx,
    ds: &DeliveryServiceInfo,
    principal: &Principal,
) -> EngineResult<()> {
    if let Some(lock) = tx.cdn_lock(ds.cdn_id).await? {
        if lock.blocks(&principal.username) {
            tracing::info!(cdn = %ds.cdn_name, holder = %lock.username, "mutation blocked by CDN lock");
            return Err(DomainError::forbidden(format!(
                "This CDN is currently locked by {}",
                lock.username
            ))
            .into());
        }
    }
    Ok(())
}

async fn record_change(
    tx: &mut dyn JobTx,
    action: JobAction,
    job: &JobRecord,
    duplicate: bool,
    principal: &Principal,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let entry = ChangeLogEntry::api_change(
        job_message(action, job, duplicate),
        principal.user_id,
        principal.username.clone(),
        now,
    );
    tx.append_change_log(entry).await?;
    Ok(())
}
