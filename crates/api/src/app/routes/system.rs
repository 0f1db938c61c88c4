use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use crate::app::services::AppServices;
use crate::context::PrincipalContext;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "store": services.backend,
    }))
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    let p = principal.principal();
    Json(serde_json::json!({
        "id": p.user_id,
        "username": p.username,
        "tenantId": p.tenant_id,
        "roles": p.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        "permissions": p.permissions().iter().map(|perm| perm.as_str().to_string()).collect::<Vec<_>>(),
    }))
}
