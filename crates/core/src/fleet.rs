//! Fleet member (cache server) flags touched by invalidation jobs.

use serde::{Deserialize, Serialize};

use crate::id::DeliveryServiceId;

/// Global parameter toggling incremental revalidation.
pub const USE_REVAL_PENDING_PARAMETER: &str = "use_reval_pending";
/// Config file of global parameters.
pub const GLOBAL_CONFIG_FILE: &str = "global";
/// Config file watched by servers that apply invalidation jobs.
pub const REVALIDATE_CONFIG_FILE: &str = "regex_revalidate.config";
/// Parameter (under [`REVALIDATE_CONFIG_FILE`]) bounding job age and TTL, in days.
pub const MAX_REVAL_DURATION_DAYS_PARAMETER: &str = "maxRevalDurationDays";

/// Operational status of a fleet member.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Online,
    Reported,
    AdminDown,
    Offline,
    PreProd,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "ONLINE",
            ServerStatus::Reported => "REPORTED",
            ServerStatus::AdminDown => "ADMIN_DOWN",
            ServerStatus::Offline => "OFFLINE",
            ServerStatus::PreProd => "PRE_PROD",
        }
    }

    /// Offline and pre-production servers are never queued.
    pub fn skips_revalidation(&self) -> bool {
        matches!(self, ServerStatus::Offline | ServerStatus::PreProd)
    }

    /// Statuses skipped by revalidation, for stores that filter in SQL.
    pub fn excluded_from_revalidation() -> [ServerStatus; 2] {
        [ServerStatus::Offline, ServerStatus::PreProd]
    }
}

/// Which pending flag a propagation sets on fleet members.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingFlag {
    /// Incremental mode: servers re-read only their revalidation rules.
    RevalPending,
    /// Full mode: servers resync their whole configuration.
    UpdPending,
}

impl PendingFlag {
    /// Decide from the `use_reval_pending` global parameter.
    ///
    /// Absent or `"0"` selects the full resync flag.
    pub fn from_parameter(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("0") => PendingFlag::UpdPending,
            Some(_) => PendingFlag::RevalPending,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            PendingFlag::RevalPending => "reval_pending",
            PendingFlag::UpdPending => "upd_pending",
        }
    }
}

/// Delivery service whose CDN gets marked, by id or by `xmlId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevalidationScope {
    ById(DeliveryServiceId),
    ByName(String),
}

impl core::fmt::Display for RevalidationScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RevalidationScope::ById(id) => write!(f, "deliveryservice #{id}"),
            RevalidationScope::ByName(name) => write!(f, "deliveryservice '{name}'"),
        }
    }
}
