use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/credits/balance", get(get_balance))
        .route("/api/credits/transactions", get(list_transactions))
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
) -> axum::response::Response {
    match services.ledger.balance(auth.user_id).await {
        Ok(balance) => (
            StatusCode::OK,
            Json(serde_json::json!({ "balance": balance })),
        )
            .into_response(),
        Err(e) => errors::generation_error_to_response(&e),
    }
}

pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50)
        .min(200);

    match services.ledger.entries(auth.user_id, limit).await {
        Ok(entries) => {
            let items: Vec<_> = entries.iter().map(dto::ledger_entry_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::generation_error_to_response(&e),
    }
}
