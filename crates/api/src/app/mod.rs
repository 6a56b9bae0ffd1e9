//! HTTP API application wiring (Axum router + service wiring).
//!
//! Layout:
//! - `services.rs`: store/ledger/gateway/synchronizer wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::auth::Hs256JwtValidator;
use crate::config::Config;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: Config) -> Router {
    let services = Arc::new(services::build_services(config).await);
    build_router(services)
}

/// Assemble routes around pre-built services (tests inject scripted
/// providers here).
pub fn build_router(services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(Hs256JwtValidator::new(
        services.config.jwt_secret.as_bytes(),
    ));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require a valid bearer token.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // The webhook authenticates with the shared provider secret instead.
    let webhook = routes::webhook::router().layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(webhook)
        .merge(protected)
        .layer(ServiceBuilder::new())
}
