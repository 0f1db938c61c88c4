//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and the job engine
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: alert envelope and request bodies
//! - `errors.rs`: error to status mapping

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::config::ApiConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router from process configuration (entrypoint used by `main.rs`).
pub async fn build_app(config: &ApiConfig) -> Result<Router, services::ServicesError> {
    let services = services::build_services(config).await?;
    Ok(build_router(&config.jwt_secret, Arc::new(services)))
}

/// Build the router around already-constructed services.
pub fn build_router(jwt_secret: &str, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(edgepurge_auth::Hs256JwtValidator::new(jwt_secret.as_bytes().to_vec()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require a valid bearer token.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_id_middleware))
                .layer(Extension(services)),
        )
}

pub use services::AppServices;
