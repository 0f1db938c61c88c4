//! Change-log recorder: audit text for job mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edgepurge_core::{JobRecord, UserId};

/// Level every API-originated change-log row carries.
pub const API_CHANGE_LEVEL: &str = "APICHANGE";

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub level: String,
    pub message: String,
    pub user_id: UserId,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// What happened to the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobAction {
    Created,
    Updated,
    Deleted,
}

impl JobAction {
    fn verb(&self) -> &'static str {
        match self {
            JobAction::Created => "Created",
            JobAction::Updated => "Updated",
            JobAction::Deleted => "Deleted",
        }
    }
}

/// Audit text for a job mutation. `duplicate` marks writes that overlapped other jobs.
pub fn job_message(action: JobAction, job: &JobRecord, duplicate: bool) -> String {
    let marker = if duplicate { "(duplicate) " } else { "" };
    format!(
        "{} content invalidation job {}- ID: {} DS: {} URL: '{}' Params: '{}'",
        action.verb(),
        marker,
        job.id,
        job.delivery_service,
        job.asset_url,
        job.ttl_hours.parameters(),
    )
}

impl ChangeLogEntry {
    pub fn api_change(
        message: String,
        user_id: UserId,
        username: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            level: API_CHANGE_LEVEL.to_string(),
            message,
            user_id,
            username: username.into(),
            created_at,
        }
    }
}
