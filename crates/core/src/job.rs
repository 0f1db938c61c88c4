//! Content invalidation job model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{DeliveryServiceId, JobId, UserId};
use crate::value_object::ValueObject;

/// Legacy keyword every job reports.
pub const JOB_KEYWORD: &str = "PURGE";

/// Invalidation type persisted with new jobs.
pub const INVALIDATION_TYPE_REFRESH: &str = "REFRESH";

/// Positive number of hours a job stays in effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TtlHours(u32);

impl ValueObject for TtlHours {}

impl TtlHours {
    /// Largest TTL a store column (32-bit signed) can hold.
    pub const MAX_HOURS: i64 = i32::MAX as i64;

    pub fn new(hours: i64) -> DomainResult<Self> {
        if hours <= 0 {
            return Err(DomainError::validation("ttlHours: must be a positive integer"));
        }
        if hours > Self::MAX_HOURS {
            return Err(DomainError::validation(format!(
                "ttlHours: cannot exceed {} hours",
                Self::MAX_HOURS
            )));
        }
        u32::try_from(hours)
            .map(Self)
            .map_err(|_| DomainError::validation("ttlHours: out of range"))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn duration(&self) -> Duration {
        Duration::hours(i64::from(self.0))
    }

    /// Display form used by the `parameters` field: `TTL:<n>h`.
    pub fn parameters(&self) -> String {
        format!("TTL:{}h", self.0)
    }

    /// Parse the legacy `TTL:<n>h` display form back into hours.
    pub fn from_parameters(parameters: &str) -> DomainResult<Self> {
        let hours = parameters
            .trim()
            .strip_prefix("TTL:")
            .and_then(|rest| rest.strip_suffix('h'))
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "parameters: expected 'TTL:<hours>h', got '{parameters}'"
                ))
            })?;
        let hours = hours.parse::<i64>().map_err(|_| {
            DomainError::validation(format!("parameters: invalid TTL '{parameters}'"))
        })?;
        Self::new(hours)
    }
}

impl TryFrom<i64> for TtlHours {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TtlHours> for i32 {
    fn from(value: TtlHours) -> Self {
        // Bounded by MAX_HOURS at construction.
        i32::try_from(value.0).unwrap_or(i32::MAX)
    }
}

impl From<TtlHours> for i64 {
    fn from(value: TtlHours) -> Self {
        i64::from(value.0)
    }
}

/// Lifecycle position of a job relative to "now".
///
/// `Removed` is not represented: a deleted job no longer exists and only leaves a
/// tombstone behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Start time still in the future; the job may be replaced.
    Pending,
    /// Start time reached; config generators treat the job as in effect.
    Active,
}

/// Stored job, joined with the display names of its delivery service and creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub asset_url: String,
    pub delivery_service_id: DeliveryServiceId,
    pub delivery_service: String,
    pub created_by_id: UserId,
    pub created_by: String,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: TtlHours,
    pub entered_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Entity for JobRecord {
    type Id = JobId;

    fn id(&self) -> JobId {
        self.id
    }
}

impl JobRecord {
    /// Saturates at the latest representable instant.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time
            .checked_add_signed(self.ttl_hours.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.start_time > now {
            JobState::Pending
        } else {
            JobState::Active
        }
    }

    /// Replace is only permitted while the job is pending.
    pub fn ensure_mutable(&self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.state(now) {
            JobState::Pending => Ok(()),
            JobState::Active => Err(DomainError::AlreadyStarted),
        }
    }

    pub fn to_view(&self) -> InvalidationJob {
        InvalidationJob {
            id: self.id,
            asset_url: self.asset_url.clone(),
            created_by: self.created_by.clone(),
            delivery_service: self.delivery_service.clone(),
            keyword: JOB_KEYWORD.to_string(),
            parameters: self.ttl_hours.parameters(),
            start_time: self.start_time,
            ttl_hours: self.ttl_hours.get(),
        }
    }
}

/// Wire representation of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationJob {
    pub id: JobId,
    pub asset_url: String,
    pub created_by: String,
    pub delivery_service: String,
    pub keyword: String,
    pub parameters: String,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(start: DateTime<Utc>, ttl: i64) -> JobRecord {
        JobRecord {
            id: JobId::new(1),
            asset_url: "http://o.example/a".to_string(),
            delivery_service_id: DeliveryServiceId::new(5),
            delivery_service: "demo1".to_string(),
            created_by_id: UserId::new(2),
            created_by: "admin".to_string(),
            start_time: start,
            ttl_hours: TtlHours::new(ttl).unwrap(),
            entered_time: start,
            last_updated: start,
        }
    }

    #[test]
    fn ttl_must_be_positive() {
        assert!(TtlHours::new(0).is_err());
        assert!(TtlHours::new(-3).is_err());
        assert_eq!(TtlHours::new(24).unwrap().get(), 24);
    }

    #[test]
    fn ttl_fits_a_signed_32_bit_column() {
        let max = TtlHours::new(TtlHours::MAX_HOURS).unwrap();
        assert_eq!(i32::from(max), i32::MAX);
        assert!(TtlHours::new(TtlHours::MAX_HOURS + 1).is_err());
        assert!(TtlHours::new(4_000_000_000).is_err());
    }

    #[test]
    fn end_time_saturates_instead_of_overflowing() {
        let mut job = record(DateTime::<Utc>::MAX_UTC - Duration::hours(1), 1);
        job.ttl_hours = TtlHours::new(TtlHours::MAX_HOURS).unwrap();
        assert_eq!(job.end_time(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn parameters_round_trip_through_legacy_form() {
        let ttl = TtlHours::new(36).unwrap();
        assert_eq!(ttl.parameters(), "TTL:36h");
        assert_eq!(TtlHours::from_parameters("TTL:36h").unwrap(), ttl);
        assert!(TtlHours::from_parameters("36h").is_err());
        assert!(TtlHours::from_parameters("TTL:0h").is_err());
    }

    #[test]
    fn state_follows_start_time() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let job = record(start, 4);
        assert_eq!(job.state(start - Duration::seconds(1)), JobState::Pending);
        assert_eq!(job.state(start), JobState::Active);
        assert_eq!(job.ensure_mutable(start), Err(DomainError::AlreadyStarted));
        assert_eq!(job.end_time(), start + Duration::hours(4));
    }

    #[test]
    fn view_carries_derived_fields() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let view = record(start, 4).to_view();
        assert_eq!(view.keyword, "PURGE");
        assert_eq!(view.parameters, "TTL:4h");
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["assetUrl"], "http://o.example/a");
        assert_eq!(json["deliveryService"], "demo1");
    }
}
