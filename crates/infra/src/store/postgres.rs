//! Postgres-backed store.
//!
//! Each [`JobTx`] wraps one `sqlx` transaction. Dynamic SQL is assembled with
//! [`QueryBuilder`]: identifiers only ever come from fixed tables in this crate
//! ([`JobField::column`], [`PendingFlag::column`]) and every caller value is a bind
//! parameter.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database | `Database` |
//! | ColumnDecode / Decode / TypeNotFound | `Serialization` |
//! | PoolClosed / PoolTimedOut / Io | `Unavailable` |
//! | Other | `Database` |

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};

use edgepurge_auth::{AuthTarget, TenantDirectory};
use edgepurge_core::{
    CdnId, DeliveryServiceId, DeliveryServiceInfo, DeliveryServiceRef, INVALIDATION_TYPE_REFRESH,
    JOB_KEYWORD, JobId, JobRecord, Origin, PendingFlag, REVALIDATE_CONFIG_FILE, RevalidationScope,
    ServerStatus, TenantId, TtlHours, UserId,
};

use super::in_memory::JOB_TABLE;
use super::{CdnLock, JobChanges, JobStore, JobTx, NewJob, StoreError};
use crate::changelog::ChangeLogEntry;
use crate::jobs::query::{JobField, JobFilter, JobQuery, JobScope};

/// Schema the store expects.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Profile parameter marking servers that consume revalidation rules.
const REVALIDATE_LOCATION_PARAMETER: &str = "location";

const JOB_COLUMNS: &str = "SELECT job.id, job.asset_url, job.start_time, job.ttl_hr, \
     job.entered_time, job.last_updated, ds.id AS ds_id, ds.xml_id, u.id AS user_id, u.username";

const JOB_FROM: &str = " FROM job \
     JOIN deliveryservice ds ON ds.id = job.job_deliveryservice \
     JOIN tm_user u ON u.id = job.job_user \
     JOIN cdn ON cdn.id = ds.cdn_id";

const DS_SELECT: &str = "SELECT ds.id, ds.xml_id, ds.tenant_id, ds.cdn_id, cdn.name AS cdn_name, \
     o.protocol, o.fqdn, o.port \
     FROM deliveryservice ds \
     JOIN cdn ON cdn.id = ds.cdn_id \
     LEFT JOIN origin o ON o.deliveryservice = ds.id AND o.is_primary";

const SUBTREE_CTE: &str = "WITH RECURSIVE subtree AS ( \
     SELECT id, active FROM tenant WHERE id = $1 \
     UNION \
     SELECT t.id, t.active FROM tenant t JOIN subtree s ON t.parent_id = s.id)";

/// Pool-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and size the pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(StdDuration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create missing tables. Idempotent.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn JobTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

/// Open Postgres transaction. Rolled back by `sqlx` when dropped uncommitted.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTx {
    async fn fetch_jobs(&mut self, mut qb: QueryBuilder<'_, Postgres>) -> Result<Vec<JobRecord>, StoreError> {
        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl TenantDirectory for PostgresTx {
    type Error = StoreError;

    async fn owning_tenant(&mut self, target: &AuthTarget) -> Result<Option<TenantId>, StoreError> {
        let query = match target {
            AuthTarget::DeliveryServiceId(id) => {
                sqlx::query("SELECT tenant_id FROM deliveryservice WHERE id = $1").bind(id.get())
            }
            AuthTarget::DeliveryServiceName(name) => {
                sqlx::query("SELECT tenant_id FROM deliveryservice WHERE xml_id = $1").bind(name.as_str())
            }
            AuthTarget::UserId(id) => sqlx::query("SELECT tenant_id FROM tm_user WHERE id = $1").bind(id.get()),
            AuthTarget::Username(name) => {
                sqlx::query("SELECT tenant_id FROM tm_user WHERE username = $1").bind(name.as_str())
            }
        };
        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("owning_tenant", e))?;
        row.map(|r| r.try_get::<i64, _>("tenant_id").map(TenantId::new))
            .transpose()
            .map_err(|e| map_sqlx_error("owning_tenant", e))
    }

    async fn tenant_in_subtree(
        &mut self,
        acting: TenantId,
        target: TenantId,
    ) -> Result<Option<bool>, StoreError> {
        let sql = format!("{SUBTREE_CTE} SELECT active FROM subtree WHERE id = $2");
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(acting.get())
            .bind(target.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("tenant_in_subtree", e))
    }
}

#[async_trait]
impl JobTx for PostgresTx {
    async fn delivery_service(
        &mut self,
        reference: &DeliveryServiceRef,
    ) -> Result<Option<DeliveryServiceInfo>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(DS_SELECT);
        match reference {
            DeliveryServiceRef::Id(id) => qb.push(" WHERE ds.id = ").push_bind(id.get()),
            DeliveryServiceRef::Name(name) => qb.push(" WHERE ds.xml_id = ").push_bind(name.clone()),
        };
        let row = qb
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delivery_service", e))?;
        row.as_ref().map(ds_from_row).transpose()
    }

    async fn accessible_tenants(&mut self, acting: TenantId) -> Result<Vec<TenantId>, StoreError> {
        let sql = format!("{SUBTREE_CTE} SELECT id FROM subtree WHERE active");
        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(acting.get())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("accessible_tenants", e))?;
        Ok(ids.into_iter().map(TenantId::new).collect())
    }

    async fn parameter(&mut self, name: &str, config_file: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM parameter WHERE name = $1 AND config_file = $2 ORDER BY id LIMIT 1",
        )
        .bind(name)
        .bind(config_file)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("parameter", e))
    }

    async fn cdn_lock(&mut self, cdn: CdnId) -> Result<Option<CdnLock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT cl.username,
                   COALESCE(array_agg(clu.username) FILTER (WHERE clu.username IS NOT NULL), '{}') AS shared
            FROM cdn_lock cl
            LEFT JOIN cdn_lock_user clu ON clu.cdn = cl.cdn
            WHERE cl.cdn = $1
            GROUP BY cl.username
            "#,
        )
        .bind(cdn.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("cdn_lock", e))?;

        row.map(|r| -> Result<CdnLock, sqlx::Error> {
            Ok(CdnLock {
                cdn,
                username: r.try_get("username")?,
                shared_usernames: r.try_get("shared")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("cdn_lock", e))
    }

    #[instrument(skip(self), fields(operation = "job"), err)]
    async fn job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(JOB_COLUMNS);
        qb.push(JOB_FROM).push(" WHERE job.id = ").push_bind(id.get());
        Ok(self.fetch_jobs(qb).await?.into_iter().next())
    }

    async fn jobs_for_delivery_service(
        &mut self,
        ds: DeliveryServiceId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(JOB_COLUMNS);
        qb.push(JOB_FROM)
            .push(" WHERE job.job_deliveryservice = ")
            .push_bind(ds.get());
        self.fetch_jobs(qb).await
    }

    #[instrument(
        skip(self, job),
        fields(operation = "insert_job", ds_id = %job.delivery_service_id, job_id = tracing::field::Empty),
        err
    )]
    async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job (asset_url, job_deliveryservice, job_user, start_time, ttl_hr,
                             entered_time, keyword, parameters, invalidation_type, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $6)
            RETURNING id
            "#,
        )
        .bind(&job.asset_url)
        .bind(job.delivery_service_id.get())
        .bind(job.created_by_id.get())
        .bind(job.start_time)
        .bind(ttl_column(job.ttl_hours))
        .bind(job.entered_time)
        .bind(JOB_KEYWORD)
        .bind(job.ttl_hours.parameters())
        .bind(INVALIDATION_TYPE_REFRESH)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        Span::current().record("job_id", id);
        self.job(JobId::new(id))
            .await?
            .ok_or_else(|| StoreError::Database(format!("inserted job {id} not readable")))
    }

    #[instrument(skip(self, changes), fields(operation = "update_job"), err)]
    async fn update_job(
        &mut self,
        id: JobId,
        changes: JobChanges,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET asset_url = $1, ttl_hr = $2, start_time = $3, parameters = $4, last_updated = $5
            WHERE id = $6
            "#,
        )
        .bind(&changes.asset_url)
        .bind(ttl_column(changes.ttl_hours))
        .bind(changes.start_time)
        .bind(changes.ttl_hours.parameters())
        .bind(now)
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("job {id} vanished during update")));
        }
        self.job(id)
            .await?
            .ok_or_else(|| StoreError::Database(format!("updated job {id} not readable")))
    }

    #[instrument(skip(self), fields(operation = "delete_job"), err)]
    async fn delete_job(&mut self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError> {
        let Some(record) = self.job(id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        sqlx::query(
            r#"
            INSERT INTO last_deleted (table_name, last_updated) VALUES ($1, $2)
            ON CONFLICT (table_name)
            DO UPDATE SET last_updated = GREATEST(last_deleted.last_updated, EXCLUDED.last_updated)
            "#,
        )
        .bind(JOB_TABLE)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_job", e))?;

        Ok(Some(record))
    }

    #[instrument(skip(self, scope, query), fields(operation = "list_jobs", job_count = tracing::field::Empty), err)]
    async fn list_jobs(&mut self, scope: &JobScope, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(JOB_COLUMNS);
        qb.push(JOB_FROM);
        push_predicates(&mut qb, scope, query);

        let order = query.order_by.unwrap_or(JobField::Id);
        let dir = query.sort.as_sql();
        qb.push(" ORDER BY ")
            .push(order.column())
            .push(" ")
            .push(dir)
            .push(", job.id ")
            .push(dir);
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(clamp_i64(limit));
        }
        if query.offset > 0 {
            qb.push(" OFFSET ").push_bind(clamp_i64(query.offset));
        }

        let jobs = self.fetch_jobs(qb).await?;
        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }

    async fn jobs_last_modified(
        &mut self,
        scope: &JobScope,
        query: &JobQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT MAX(t) FROM (SELECT MAX(job.last_updated) AS t");
        qb.push(JOB_FROM);
        push_predicates(&mut qb, scope, query);
        qb.push(" UNION ALL SELECT l.last_updated AS t FROM last_deleted l WHERE l.table_name = ")
            .push_bind(JOB_TABLE)
            .push(") AS lm");

        let row = qb
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("jobs_last_modified", e))?;
        row.try_get::<Option<DateTime<Utc>>, _>(0)
            .map_err(|e| map_sqlx_error("jobs_last_modified", e))
    }

    #[instrument(skip(self, scope, flag), fields(operation = "mark_fleet", scope = %scope, flag = flag.column()), err)]
    async fn mark_fleet(&mut self, scope: &RevalidationScope, flag: PendingFlag) -> Result<u64, StoreError> {
        let excluded: Vec<&str> = ServerStatus::excluded_from_revalidation()
            .iter()
            .map(ServerStatus::as_str)
            .collect();

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE server SET ");
        qb.push(flag.column())
            .push(" = TRUE WHERE server.status <> ALL(")
            .push_bind(excluded)
            .push(") AND server.profile IN (SELECT pp.profile FROM profile_parameter pp \
                   JOIN parameter p ON p.id = pp.parameter WHERE p.name = ")
            .push_bind(REVALIDATE_LOCATION_PARAMETER)
            .push(" AND p.config_file = ")
            .push_bind(REVALIDATE_CONFIG_FILE)
            .push(") AND server.cdn_id = (SELECT ds.cdn_id FROM deliveryservice ds WHERE ");
        match scope {
            RevalidationScope::ById(id) => qb.push("ds.id = ").push_bind(id.get()),
            RevalidationScope::ByName(name) => qb.push("ds.xml_id = ").push_bind(name.clone()),
        };
        qb.push(")");

        let result = qb
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_fleet", e))?;
        Ok(result.rows_affected())
    }

    async fn append_change_log(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO log (level, message, tm_user, last_updated) VALUES ($1, $2, $3, $4)")
            .bind(&entry.level)
            .bind(&entry.message)
            .bind(entry.user_id.get())
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("append_change_log", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }
}

/// Tenant scope, recency window, CDN and allow-listed filters.
fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, scope: &JobScope, query: &JobQuery) {
    let tenants: Vec<i64> = scope.tenants.iter().map(TenantId::get).collect();
    qb.push(" WHERE ds.tenant_id = ANY(").push_bind(tenants).push(")");

    if let Some(after) = scope.started_after {
        qb.push(" AND job.start_time >= ").push_bind(after);
    }
    if let Some(cdn) = &query.cdn {
        qb.push(" AND cdn.name = ").push_bind(cdn.clone());
    }
    for filter in &query.filters {
        qb.push(" AND ").push(filter.field().column()).push(" = ");
        match filter {
            JobFilter::Id(id) => qb.push_bind(id.get()),
            JobFilter::UserId(id) => qb.push_bind(id.get()),
            JobFilter::DsId(id) => qb.push_bind(id.get()),
            JobFilter::StartTime(at) => qb.push_bind(*at),
            JobFilter::Keyword(s)
            | JobFilter::AssetUrl(s)
            | JobFilter::CreatedBy(s)
            | JobFilter::DeliveryService(s) => qb.push_bind(s.clone()),
        };
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let decode = |e| map_sqlx_error("decode job", e);
    let ttl: i32 = row.try_get("ttl_hr").map_err(decode)?;
    let ttl_hours = TtlHours::new(i64::from(ttl))
        .map_err(|e| StoreError::Serialization(format!("job ttl_hr: {e}")))?;
    Ok(JobRecord {
        id: JobId::new(row.try_get("id").map_err(decode)?),
        asset_url: row.try_get("asset_url").map_err(decode)?,
        delivery_service_id: DeliveryServiceId::new(row.try_get("ds_id").map_err(decode)?),
        delivery_service: row.try_get("xml_id").map_err(decode)?,
        created_by_id: UserId::new(row.try_get("user_id").map_err(decode)?),
        created_by: row.try_get("username").map_err(decode)?,
        start_time: row.try_get("start_time").map_err(decode)?,
        ttl_hours,
        entered_time: row.try_get("entered_time").map_err(decode)?,
        last_updated: row.try_get("last_updated").map_err(decode)?,
    })
}

fn ds_from_row(row: &PgRow) -> Result<DeliveryServiceInfo, StoreError> {
    let decode = |e| map_sqlx_error("decode deliveryservice", e);
    let protocol: Option<String> = row.try_get("protocol").map_err(decode)?;
    let fqdn: Option<String> = row.try_get("fqdn").map_err(decode)?;
    let port: Option<i32> = row.try_get("port").map_err(decode)?;
    let origin = match (protocol, fqdn) {
        (Some(protocol), Some(fqdn)) => Some(Origin {
            protocol,
            fqdn,
            port: port.and_then(|p| u16::try_from(p).ok()),
        }),
        _ => None,
    };
    Ok(DeliveryServiceInfo {
        id: DeliveryServiceId::new(row.try_get("id").map_err(decode)?),
        xml_id: row.try_get("xml_id").map_err(decode)?,
        tenant_id: TenantId::new(row.try_get("tenant_id").map_err(decode)?),
        cdn_id: CdnId::new(row.try_get("cdn_id").map_err(decode)?),
        cdn_name: row.try_get("cdn_name").map_err(decode)?,
        origin,
    })
}

fn ttl_column(ttl: TtlHours) -> i32 {
    i32::from(ttl)
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Database(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}
