use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::app::services::AppServices;
use crate::middleware::AuthContext;

pub fn router() -> Router {
    Router::new().route("/api/stream", get(notification_stream))
}

/// SSE stream of the caller's terminal-transition notifications.
///
/// Lossy by design (broadcast channel, no backpressure on the synchronizer);
/// a dropped event is recoverable through the job status read.
pub async fn notification_stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.notifier.subscribe();
    let user_id = auth.user_id;

    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(n) if n.user_id == user_id => {
            let data = serde_json::to_string(&n).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event("generation.finalized").data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
