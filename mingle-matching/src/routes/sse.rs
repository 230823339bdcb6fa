// Server-sent events for UI consumers.
//
//   GET /events?types=match.observed,alert.in_app
//
// Each frame carries `event: <kind>` and the JSON-encoded `MatchingEvent`.
// The stream subscribes to the session's `EventBus`; filtering by kind happens
// in the stream so only requested events go over the wire.
//
// ────────────────────────────────────────────────────────────────────────────

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::events::MatchingEvent;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event kinds. Omit for everything.
    pub types: Option<String>,
}

impl EventsQuery {
    fn matches(&self, event: &MatchingEvent) -> bool {
        match &self.types {
            None => true,
            Some(types) => {
                let mut kinds = types.split(',').map(str::trim).filter(|t| !t.is_empty()).peekable();
                kinds.peek().is_none() || kinds.any(|k| k == event.kind())
            }
        }
    }
}

/// `GET /events`. Heartbeats every 15 seconds keep proxies from closing the
/// connection.
pub async fn sse_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.bus.subscribe();

    info!(types = query.types.as_deref().unwrap_or("*"), "SSE client connected");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !query.matches(&event) {
                        continue;
                    }
                    match SseEvent::default().event(event.kind()).json_data(&event) {
                        Ok(frame) => {
                            yield Ok(frame);
                        }
                        Err(e) => {
                            warn!(error = %e, "SSE: failed to serialize event");
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {n} events");
                    yield Ok(SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}")));
                }
                Err(RecvError::Closed) => {
                    info!("event bus closed, ending SSE stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
