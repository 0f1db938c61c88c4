//! `/api/4.0/jobs`: list, create, replace and delete content invalidation jobs.
//!
//! PUT and DELETE address the job with the `id` query parameter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Query, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};

use edgepurge_auth::permissions::{JOBS_CREATE, JOBS_DELETE, JOBS_READ, JOBS_UPDATE};
use edgepurge_core::{DomainError, JobId};
use edgepurge_infra::jobs::{JobMutation, JobQuery, ListOutcome, ReplaceJobRequest};

use crate::app::dto::{self, Alert, ApiResponse};
use crate::app::errors;
use crate::app::routes::API_PREFIX;
use crate::app::services::AppServices;
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new().route(
        "/jobs",
        get(list_jobs).post(create_job).put(replace_job).delete(delete_job),
    )
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(res) = authz::require(&principal, JOBS_READ) {
        return res;
    }

    let query = match JobQuery::from_params(&params) {
        Ok(q) => q,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|d| d.with_timezone(&Utc));

    let outcome = match services
        .engine
        .list(principal.principal(), &query, if_modified_since, Utc::now())
        .await
    {
        Ok(o) => o,
        Err(e) => return errors::engine_error_to_response(e),
    };

    match outcome {
        ListOutcome::NotModified { last_modified } => {
            let mut res = StatusCode::NOT_MODIFIED.into_response();
            set_last_modified(&mut res, last_modified);
            res
        }
        ListOutcome::Jobs { jobs, last_modified } => {
            let mut res = (StatusCode::OK, Json(ApiResponse::ok(jobs))).into_response();
            if let Some(at) = last_modified {
                set_last_modified(&mut res, at);
            }
            res
        }
    }
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<dto::CreateJobBody>, JsonRejection>,
) -> Response {
    if let Err(res) = authz::require(&principal, JOBS_CREATE) {
        return res;
    }

    let request = match body {
        Ok(Json(body)) => match body.into_request() {
            Ok(r) => r,
            Err(e) => return errors::domain_error_to_response(e),
        },
        Err(rejection) => return unparsable(rejection),
    };

    let mutation = match services
        .engine
        .create(principal.principal(), request, Utc::now())
        .await
    {
        Ok(m) => m,
        Err(e) => return errors::engine_error_to_response(e),
    };

    let location = format!("{API_PREFIX}/jobs?id={}", mutation.record.id);
    let mut res = mutation_response(&mutation, "created");
    if let Ok(value) = HeaderValue::from_str(&location) {
        res.headers_mut().insert(header::LOCATION, value);
    }
    res
}

pub async fn replace_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Err(res) = authz::require(&principal, JOBS_UPDATE) {
        return res;
    }

    let id = match job_id_param(&params) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    // Decoded after the started-job check so an active job answers 405 for any body.
    let decode = move || dto::ReplaceJobBody::from_slice(&body).map(ReplaceJobRequest::from);

    match services
        .engine
        .replace_with(principal.principal(), id, decode, Utc::now())
        .await
    {
        Ok(mutation) => mutation_response(&mutation, "updated"),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(res) = authz::require(&principal, JOBS_DELETE) {
        return res;
    }

    let id = match job_id_param(&params) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.delete(principal.principal(), id, Utc::now()).await {
        Ok(job) => (
            StatusCode::OK,
            Json(ApiResponse::with_alerts(
                vec![Alert::success("Content invalidation job was deleted")],
                job,
            )),
        )
            .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

fn mutation_response(mutation: &JobMutation, verb: &str) -> Response {
    let record = &mutation.record;
    let success = format!(
        "Invalidation request {verb} for {}, start:{} end {}",
        record.asset_url,
        record.start_time.to_rfc3339(),
        record.end_time().to_rfc3339(),
    );
    let alerts = dto::mutation_alerts(&mutation.conflicts, success);
    (StatusCode::OK, Json(ApiResponse::with_alerts(alerts, mutation.view()))).into_response()
}

fn job_id_param(params: &HashMap<String, String>) -> Result<JobId, DomainError> {
    params
        .get("id")
        .ok_or_else(|| DomainError::validation("missing key: id"))?
        .parse()
}

fn unparsable(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection.body_text(), "rejected job payload");
    errors::alert_error(StatusCode::BAD_REQUEST, "Unable to parse Invalidation Job")
}

fn set_last_modified(res: &mut Response, at: DateTime<Utc>) {
    let value = at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    if let Ok(value) = HeaderValue::from_str(&value) {
        res.headers_mut().insert(header::LAST_MODIFIED, value);
    }
}
