use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edgepurge_core::{DeliveryServiceRef, DomainError, JobConflict, JobId};
use edgepurge_infra::jobs::{NewJobRequest, ReplaceJobRequest};

// -------------------------
// Envelope
// -------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub text: String,
}

impl Alert {
    pub fn success(text: impl Into<String>) -> Self {
        Self { level: AlertLevel::Success, text: text.into() }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self { level: AlertLevel::Warning, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { level: AlertLevel::Error, text: text.into() }
    }
}

/// `{"alerts": [...], "response": ...}`; both keys are omitted when empty.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(response: T) -> Self {
        Self { alerts: Vec::new(), response: Some(response) }
    }

    pub fn with_alerts(alerts: Vec<Alert>, response: T) -> Self {
        Self { alerts, response: Some(response) }
    }

    pub fn alerts(alerts: Vec<Alert>) -> Self {
        Self { alerts, response: None }
    }
}

/// Conflict warnings first, then the success text.
pub fn mutation_alerts(conflicts: &[JobConflict], success: String) -> Vec<Alert> {
    conflicts
        .iter()
        .map(|c| Alert::warning(c.to_string()))
        .chain(std::iter::once(Alert::success(success)))
        .collect()
}

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobBody {
    pub delivery_service: Option<DeliveryServiceRef>,
    #[serde(alias = "regex", alias = "assetURL")]
    pub asset_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub ttl_hours: Option<i64>,
}

impl CreateJobBody {
    /// Every missing field is reported at once.
    pub fn into_request(self) -> Result<NewJobRequest, DomainError> {
        let mut missing = Vec::new();
        if self.delivery_service.is_none() {
            missing.push("deliveryService: cannot be blank");
        }
        if self.asset_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            missing.push("assetUrl: cannot be blank");
        }
        if self.start_time.is_none() {
            missing.push("startTime: cannot be blank");
        }
        if self.ttl_hours.is_none() {
            missing.push("ttlHours: cannot be blank");
        }

        match (self.delivery_service, self.asset_url, self.start_time, self.ttl_hours) {
            (Some(delivery_service), Some(asset_url), Some(start_time), Some(ttl_hours))
                if missing.is_empty() =>
            {
                Ok(NewJobRequest { delivery_service, asset_url, start_time, ttl_hours })
            }
            _ => Err(DomainError::validation(missing.join("; "))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceJobBody {
    pub id: Option<JobId>,
    pub delivery_service: Option<DeliveryServiceRef>,
    pub created_by: Option<String>,
    #[serde(alias = "regex", alias = "assetURL")]
    pub asset_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub ttl_hours: Option<i64>,
    pub parameters: Option<String>,
}

impl ReplaceJobBody {
    pub fn from_slice(raw: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(raw).map_err(|e| {
            tracing::debug!(error = %e, "rejected replacement payload");
            DomainError::validation("Unable to parse Invalidation Job")
        })
    }
}

impl From<ReplaceJobBody> for ReplaceJobRequest {
    fn from(body: ReplaceJobBody) -> Self {
        ReplaceJobRequest {
            id: body.id,
            delivery_service: body.delivery_service,
            created_by: body.created_by,
            asset_url: body.asset_url,
            start_time: body.start_time,
            ttl_hours: body.ttl_hours,
            parameters: body.parameters,
        }
    }
}
