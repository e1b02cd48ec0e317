//! Observer endpoints for the activity broadcaster. The SSE stream is a
//! live tap of the bus: best-effort, no replay, no delivery guarantee. A
//! client that reconnects re-derives current state from the pull APIs
//! (`/downloads`, `/services`) rather than from missed events. The
//! journal listing is a separate audit view and feeds nothing.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::app_state::AppState;
use crate::errors::OpsError;

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Comma-separated topic prefixes, e.g. `service.install,downloads`.
    prefix: Option<String>,
}

pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> impl IntoResponse {
    let prefixes: Vec<String> = q
        .prefix
        .as_deref()
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let rx = state.bus().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        // Lagged receivers drop the missed events and keep streaming.
        let env = item.ok()?;
        if !prefixes.is_empty() && !prefixes.iter().any(|p| env.kind.starts_with(p.as_str())) {
            return None;
        }
        let data = serde_json::to_string(&env.payload).ok()?;
        Some(Ok::<_, std::convert::Infallible>(
            SseEvent::default().event(env.kind).data(data),
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
pub struct RecentQuery {
    limit: Option<i64>,
}

/// Recent journaled events, oldest first. Audit/debug only.
pub async fn events_recent(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Result<impl IntoResponse, OpsError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let rows = state.kernel().recent_events_async(limit).await?;
    Ok(Json(rows))
}
