use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use lumagen_core::GenerationError;

pub fn generation_error_to_response(err: &GenerationError) -> axum::response::Response {
    match err {
        GenerationError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg.clone())
        }
        GenerationError::InsufficientCredits { required, available } => (
            StatusCode::PAYMENT_REQUIRED,
            axum::Json(json!({
                "error": "insufficient_credits",
                "message": format!("need {required} credits, have {available}"),
                "required": required,
                "available": available,
            })),
        )
            .into_response(),
        GenerationError::AcquireTimeout { .. } | GenerationError::CircuitOpen { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "provider_busy",
                "message": "the provider is busy, try again shortly",
                "retryable": true,
            })),
        )
            .into_response(),
        GenerationError::ProviderUnavailable(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "provider_unavailable",
                "message": msg,
                "retryable": true,
            })),
        )
            .into_response(),
        GenerationError::ProviderRejected(msg) => {
            json_error(StatusCode::BAD_GATEWAY, "provider_rejected", msg.clone())
        }
        GenerationError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        GenerationError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg.clone()),
        GenerationError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg.clone())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
