use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RabbitMQ Event envelope wrapping all domain events.
///
/// Routing key format: `mingle.{domain}.{entity}.{action}`
/// Example: `mingle.matching.match.observed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            session_id: None,
            data,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// RabbitMQ routing keys
pub mod routing_keys {
    // Matching events
    pub const MATCHING_MATCH_OBSERVED: &str = "mingle.matching.match.observed";
    pub const MATCHING_LIKE_OBSERVED: &str = "mingle.matching.like.observed";
}

/// Common event data payloads
pub mod payloads {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Both directions of a like pair exist and are marked mutual.
    ///
    /// `pair_id` is derived from the event and the sorted session ids, so every
    /// observer of the same pair computes the same key.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MatchObserved {
        pub pair_id: String,
        pub event_id: String,
        pub user_a: String,
        pub user_b: String,
    }

    /// A one-directional like. Carries session ids only, never names.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LikeObserved {
        pub like_id: Uuid,
        pub event_id: String,
        pub from: String,
        pub to: String,
        pub is_mutual: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InAppAlert {
        pub pair_id: String,
        pub recipient: String,
        pub title: String,
        pub body: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UnseenMessages {
        pub session_id: String,
        pub count: usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_session_and_payload() {
        let event = Event::new(
            "mingle-matching",
            routing_keys::MATCHING_MATCH_OBSERVED,
            payloads::MatchObserved {
                pair_id: "ev:a:b".into(),
                event_id: "ev".into(),
                user_a: "a".into(),
                user_b: "b".into(),
            },
        )
        .with_session("a");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "mingle.matching.match.observed");
        assert_eq!(json["session_id"], "a");
        assert_eq!(json["data"]["pair_id"], "ev:a:b");
    }
}
