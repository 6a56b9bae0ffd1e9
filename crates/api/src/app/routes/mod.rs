use axum::Router;

pub mod admin;
pub mod credits;
pub mod generate;
pub mod jobs;
pub mod stream;
pub mod system;
pub mod webhook;

/// All routes behind the auth middleware.
pub fn router() -> Router {
    Router::new()
        .merge(generate::router())
        .merge(jobs::router())
        .merge(credits::router())
        .merge(admin::router())
        .merge(stream::router())
}
