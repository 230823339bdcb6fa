// In-process fan-out of outward matching events.
//
// A single `EventBus` backed by a `tokio::sync::broadcast` channel feeds the
// SSE stream, the RabbitMQ forwarder and anything else that wants badge or
// alert updates.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use mingle_shared::types::event::payloads::{InAppAlert, LikeObserved, MatchObserved, UnseenMessages};

// ─── Events ─────────────────────────────────────────────────────────────────

/// ```json
/// { "type": "match.observed", "data": { "pair_id": "ev:a:b", ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MatchingEvent {
    #[serde(rename = "match.observed")]
    MatchObserved(MatchObserved),
    #[serde(rename = "like.observed")]
    LikeObserved(LikeObserved),
    #[serde(rename = "alert.in_app")]
    InAppAlert(InAppAlert),
    #[serde(rename = "messages.unseen")]
    UnseenMessages(UnseenMessages),
}

impl MatchingEvent {
    /// Stable string used as the SSE `event:` field and in filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MatchObserved(_) => "match.observed",
            Self::LikeObserved(_) => "like.observed",
            Self::InAppAlert(_) => "alert.in_app",
            Self::UnseenMessages(_) => "messages.unseen",
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `MatchingEvent`.
///
/// Subscribers that lag more than the capacity skip events. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MatchingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will receive
    /// it; having none is not an error.
    pub fn emit(&self, event: MatchingEvent) -> usize {
        debug!(kind = event.kind(), "matching event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Each receiver gets every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn unseen(count: usize) -> MatchingEvent {
        MatchingEvent::UnseenMessages(UnseenMessages {
            session_id: "s-ana".into(),
            count,
        })
    }

    #[test]
    fn event_json_is_tagged_by_kind() {
        let json = serde_json::to_value(unseen(3)).unwrap();
        assert_eq!(json["type"], "messages.unseen");
        assert_eq!(json["data"]["count"], 3);

        let parsed: MatchingEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "messages.unseen");
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(unseen(1)), 2);
        assert_eq!(rx1.recv().await.unwrap(), unseen(1));
        assert_eq!(rx2.recv().await.unwrap(), unseen(1));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        assert_eq!(EventBus::new().emit(unseen(0)), 0);
    }
}
