//! Query engine: allow-listed filters, ordering and pagination for job listings.
//!
//! Caller-supplied keys are mapped onto [`JobField`] before anything else sees
//! them. A key outside the allow-list is dropped; it can never name a column.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use edgepurge_core::{
    DeliveryServiceId, DomainError, DomainResult, JOB_KEYWORD, JobId, JobRecord, TenantId, UserId,
    MAX_REVAL_DURATION_DAYS_PARAMETER,
};

/// Filterable and sortable job fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobField {
    Id,
    Keyword,
    AssetUrl,
    StartTime,
    UserId,
    CreatedBy,
    DeliveryService,
    DsId,
}

impl JobField {
    pub const ALL: [JobField; 8] = [
        JobField::Id,
        JobField::Keyword,
        JobField::AssetUrl,
        JobField::StartTime,
        JobField::UserId,
        JobField::CreatedBy,
        JobField::DeliveryService,
        JobField::DsId,
    ];

    pub fn from_param(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.param_name() == name)
    }

    pub fn param_name(&self) -> &'static str {
        match self {
            JobField::Id => "id",
            JobField::Keyword => "keyword",
            JobField::AssetUrl => "assetUrl",
            JobField::StartTime => "startTime",
            JobField::UserId => "userId",
            JobField::CreatedBy => "createdBy",
            JobField::DeliveryService => "deliveryService",
            JobField::DsId => "dsId",
        }
    }

    /// Qualified SQL column; only ever produced from this fixed table.
    pub fn column(&self) -> &'static str {
        match self {
            JobField::Id => "job.id",
            JobField::Keyword => "job.keyword",
            JobField::AssetUrl => "job.asset_url",
            JobField::StartTime => "job.start_time",
            JobField::UserId => "u.id",
            JobField::CreatedBy => "u.username",
            JobField::DeliveryService => "ds.xml_id",
            JobField::DsId => "ds.id",
        }
    }

    fn compare(&self, a: &JobRecord, b: &JobRecord) -> Ordering {
        match self {
            JobField::Id | JobField::Keyword => a.id.cmp(&b.id),
            JobField::AssetUrl => a.asset_url.cmp(&b.asset_url),
            JobField::StartTime => a.start_time.cmp(&b.start_time),
            JobField::UserId => a.created_by_id.cmp(&b.created_by_id),
            JobField::CreatedBy => a.created_by.cmp(&b.created_by),
            JobField::DeliveryService => a.delivery_service.cmp(&b.delivery_service),
            JobField::DsId => a.delivery_service_id.cmp(&b.delivery_service_id),
        }
    }
}

/// Equality predicate on one allow-listed field, with a typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    Id(JobId),
    Keyword(String),
    AssetUrl(String),
    StartTime(DateTime<Utc>),
    UserId(UserId),
    CreatedBy(String),
    DeliveryService(String),
    DsId(DeliveryServiceId),
}

impl JobFilter {
    fn parse(field: JobField, raw: &str) -> DomainResult<Self> {
        let int = |raw: &str| {
            raw.trim().parse::<i64>().map_err(|_| {
                DomainError::validation(format!("{}: must be an integer", field.param_name()))
            })
        };
        Ok(match field {
            JobField::Id => JobFilter::Id(JobId::new(int(raw)?)),
            JobField::Keyword => JobFilter::Keyword(raw.to_string()),
            JobField::AssetUrl => JobFilter::AssetUrl(raw.to_string()),
            JobField::StartTime => JobFilter::StartTime(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|_| DomainError::validation("startTime: must be an RFC3339 timestamp"))?
                    .with_timezone(&Utc),
            ),
            JobField::UserId => JobFilter::UserId(UserId::new(int(raw)?)),
            JobField::CreatedBy => JobFilter::CreatedBy(raw.to_string()),
            JobField::DeliveryService => JobFilter::DeliveryService(raw.to_string()),
            JobField::DsId => JobFilter::DsId(DeliveryServiceId::new(int(raw)?)),
        })
    }

    pub fn field(&self) -> JobField {
        match self {
            JobFilter::Id(_) => JobField::Id,
            JobFilter::Keyword(_) => JobField::Keyword,
            JobFilter::AssetUrl(_) => JobField::AssetUrl,
            JobFilter::StartTime(_) => JobField::StartTime,
            JobFilter::UserId(_) => JobField::UserId,
            JobFilter::CreatedBy(_) => JobField::CreatedBy,
            JobFilter::DeliveryService(_) => JobField::DeliveryService,
            JobFilter::DsId(_) => JobField::DsId,
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        match self {
            JobFilter::Id(id) => job.id == *id,
            JobFilter::Keyword(keyword) => keyword == JOB_KEYWORD,
            JobFilter::AssetUrl(url) => job.asset_url == *url,
            JobFilter::StartTime(at) => job.start_time == *at,
            JobFilter::UserId(id) => job.created_by_id == *id,
            JobFilter::CreatedBy(name) => job.created_by == *name,
            JobFilter::DeliveryService(name) => job.delivery_service == *name,
            JobFilter::DsId(id) => job.delivery_service_id == *id,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Parsed listing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub filters: Vec<JobFilter>,
    /// CDN name of the job's delivery service.
    pub cdn: Option<String>,
    /// Restrict to recently started jobs (`maxRevalDurationDays` was supplied).
    pub recent_only: bool,
    pub order_by: Option<JobField>,
    pub sort: SortOrder,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl JobQuery {
    /// Build from raw query-string pairs.
    pub fn from_params(params: &HashMap<String, String>) -> DomainResult<Self> {
        let mut query = JobQuery::default();

        // Stable order so repeated requests produce identical SQL.
        let keys: BTreeSet<&String> = params.keys().collect();
        for key in keys {
            if let Some(field) = JobField::from_param(key) {
                query.filters.push(JobFilter::parse(field, &params[key])?);
            }
        }

        query.cdn = params.get("cdn").cloned();
        query.recent_only = params.contains_key(MAX_REVAL_DURATION_DAYS_PARAMETER);

        if let Some(raw) = params.get("orderby") {
            let field = JobField::from_param(raw)
                .ok_or_else(|| DomainError::validation(format!("orderby: unknown field '{raw}'")))?;
            query.order_by = Some(field);
        }
        if let Some(raw) = params.get("sortOrder") {
            query.sort = match raw.as_str() {
                "asc" => SortOrder::Asc,
                "desc" => SortOrder::Desc,
                _ => return Err(DomainError::validation("sortOrder: must be 'asc' or 'desc'")),
            };
        }

        let positive = |name: &str| -> DomainResult<Option<u64>> {
            match params.get(name) {
                None => Ok(None),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(Some(n)),
                    _ => Err(DomainError::validation(format!("{name}: must be a positive integer"))),
                },
            }
        };
        query.limit = positive("limit")?;
        let page = positive("page")?;
        let offset = match params.get("offset") {
            None => None,
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| DomainError::validation("offset: must be a non-negative integer"))?,
            ),
        };

        query.offset = match (offset, page, query.limit) {
            (Some(offset), _, _) => offset,
            (None, Some(page), Some(limit)) => (page - 1)
                .checked_mul(limit)
                .ok_or_else(|| DomainError::validation("page: out of range"))?,
            (None, Some(_), None) => {
                return Err(DomainError::validation("page: requires limit"));
            }
            (None, None, _) => 0,
        };

        Ok(query)
    }

    /// Filters only; ordering and paging are applied by [`JobQuery::order_and_page`].
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.filters.iter().all(|f| f.matches(job))
    }

    pub fn order_and_page(&self, mut jobs: Vec<JobRecord>) -> Vec<JobRecord> {
        let field = self.order_by.unwrap_or(JobField::Id);
        jobs.sort_by(|a, b| {
            let ord = field.compare(a, b).then_with(|| a.id.cmp(&b.id));
            match self.sort {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        let skip = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let take = self
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        jobs.into_iter().skip(skip).take(take).collect()
    }
}

/// Server-side predicates every listing carries. Never caller-controlled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScope {
    /// Tenants whose delivery services the caller may see.
    pub tenants: Vec<TenantId>,
    /// Recency window lower bound on `start_time`.
    pub started_after: Option<DateTime<Utc>>,
}

impl JobScope {
    pub fn admits(&self, tenant: TenantId, job: &JobRecord) -> bool {
        self.tenants.contains(&tenant)
            && self.started_after.is_none_or(|after| job.start_time >= after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use edgepurge_core::TtlHours;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn job(id: i64, ds: &str, user: &str) -> JobRecord {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::hours(id);
        JobRecord {
            id: JobId::new(id),
            asset_url: format!("http://o.example/{id}"),
            delivery_service_id: DeliveryServiceId::new(id % 2),
            delivery_service: ds.to_string(),
            created_by_id: UserId::new(1),
            created_by: user.to_string(),
            start_time: at,
            ttl_hours: TtlHours::new(1).unwrap(),
            entered_time: at,
            last_updated: at,
        }
    }

    #[test]
    fn unknown_keys_never_become_filters() {
        let q = JobQuery::from_params(&params(&[("'; DROP TABLE job;--", "x"), ("id", "3")])).unwrap();
        assert_eq!(q.filters, vec![JobFilter::Id(JobId::new(3))]);
    }

    #[test]
    fn integer_fields_reject_text() {
        for key in ["id", "userId", "dsId"] {
            let err = JobQuery::from_params(&params(&[(key, "abc")])).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{key}");
        }
    }

    #[test]
    fn orderby_must_be_allow_listed() {
        assert!(JobQuery::from_params(&params(&[("orderby", "password")])).is_err());
        let q = JobQuery::from_params(&params(&[("orderby", "startTime"), ("sortOrder", "desc")])).unwrap();
        assert_eq!(q.order_by, Some(JobField::StartTime));
        assert_eq!(q.sort, SortOrder::Desc);
    }

    #[test]
    fn page_requires_limit_and_offset_wins() {
        assert!(JobQuery::from_params(&params(&[("page", "2")])).is_err());
        let q = JobQuery::from_params(&params(&[("page", "3"), ("limit", "10")])).unwrap();
        assert_eq!(q.offset, 20);
        let q = JobQuery::from_params(&params(&[("page", "3"), ("limit", "10"), ("offset", "4")])).unwrap();
        assert_eq!(q.offset, 4);
    }

    #[test]
    fn page_offset_overflow_is_rejected() {
        let err = JobQuery::from_params(&params(&[("page", "18446744073709551615"), ("limit", "2")]))
            .unwrap_err();
        assert_eq!(err, DomainError::validation("page: out of range"));
        let q = JobQuery::from_params(&params(&[("page", "18446744073709551615"), ("limit", "1")])).unwrap();
        assert_eq!(q.offset, u64::MAX - 1);
    }

    #[test]
    fn recency_window_is_opt_in() {
        assert!(!JobQuery::from_params(&params(&[])).unwrap().recent_only);
        assert!(JobQuery::from_params(&params(&[("maxRevalDurationDays", "")])).unwrap().recent_only);
    }

    #[test]
    fn filters_order_and_page_in_memory() {
        let jobs = vec![job(1, "a", "admin"), job(2, "b", "ops"), job(3, "a", "ops"), job(4, "a", "ops")];
        let q = JobQuery::from_params(&params(&[
            ("deliveryService", "a"),
            ("createdBy", "ops"),
            ("sortOrder", "desc"),
            ("limit", "1"),
        ]))
        .unwrap();
        let matched: Vec<_> = jobs.into_iter().filter(|j| q.matches(j)).collect();
        let page = q.order_and_page(matched);
        assert_eq!(page.iter().map(|j| j.id.get()).collect::<Vec<_>>(), vec![4]);
    }
}
