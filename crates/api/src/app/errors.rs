use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use edgepurge_core::DomainError;
use edgepurge_infra::jobs::EngineError;

use crate::app::dto::{Alert, ApiResponse};

/// Methods still allowed on a job that has started.
pub const STARTED_JOB_ALLOW: &str = "GET,HEAD,DELETE";

pub fn engine_error_to_response(err: EngineError) -> Response {
    match err {
        EngineError::Domain(e) => domain_error_to_response(e),
        EngineError::Store(e) => {
            tracing::error!(error = %e, "store failure");
            internal_error()
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> Response {
    let status = match &err {
        DomainError::Validation(_) | DomainError::InvalidId(_) => StatusCode::BAD_REQUEST,
        DomainError::NotFound(_) => StatusCode::NOT_FOUND,
        DomainError::AlreadyStarted => StatusCode::METHOD_NOT_ALLOWED,
        DomainError::ImmutableField(_) => StatusCode::CONFLICT,
        DomainError::Forbidden(_) => StatusCode::FORBIDDEN,
    };
    let mut res = alert_error(status, err.to_string());
    if matches!(err, DomainError::AlreadyStarted) {
        res.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static(STARTED_JOB_ALLOW));
    }
    res
}

/// Error envelope with a single error-level alert.
pub fn alert_error(status: StatusCode, text: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse::alerts(vec![Alert::error(text)]);
    (status, axum::Json(body)).into_response()
}

/// Generic 500; details stay in the server log.
pub fn internal_error() -> Response {
    alert_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}
