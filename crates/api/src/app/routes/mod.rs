use axum::{Router, routing::get};

pub mod jobs;
pub mod system;

/// API version prefix of every authenticated route.
pub const API_PREFIX: &str = "/api/4.0";

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new().nest(
        API_PREFIX,
        Router::new()
            .route("/whoami", get(system::whoami))
            .merge(jobs::router()),
    )
}
