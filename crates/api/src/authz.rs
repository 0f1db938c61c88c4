//! Route-level capability checks.
//!
//! Capability (may this role create jobs at all?) is a 403. Tenant visibility is
//! decided later by the engine and always surfaces as a 404.

use axum::http::StatusCode;
use axum::response::Response;

use edgepurge_auth::{Permission, authorize};

use crate::app::errors;
use crate::context::PrincipalContext;

/// Fail with 403 unless the caller holds `permission`.
pub fn require(principal: &PrincipalContext, permission: &'static str) -> Result<(), Response> {
    authorize(principal.principal(), &Permission::new(permission)).map_err(|e| {
        tracing::debug!(user = %principal.principal().username, permission, "capability check failed");
        errors::alert_error(StatusCode::FORBIDDEN, e.to_string())
    })
}
