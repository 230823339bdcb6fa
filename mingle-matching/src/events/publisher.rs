use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use mingle_shared::clients::rabbitmq::RabbitMQClient;
use mingle_shared::types::event::payloads::{LikeObserved, MatchObserved};
use mingle_shared::types::event::{routing_keys, Event};

use super::bus::{EventBus, MatchingEvent};

const SOURCE: &str = "mingle-matching";

pub async fn publish_match_observed(rabbitmq: &RabbitMQClient, session_id: &str, payload: MatchObserved) {
    let event = Event::new(SOURCE, routing_keys::MATCHING_MATCH_OBSERVED, payload).with_session(session_id);

    if let Err(e) = rabbitmq
        .publish(routing_keys::MATCHING_MATCH_OBSERVED, &event)
        .await
    {
        tracing::error!(error = %e, "failed to publish match.observed event");
    }
}

pub async fn publish_like_observed(rabbitmq: &RabbitMQClient, session_id: &str, payload: LikeObserved) {
    let event = Event::new(SOURCE, routing_keys::MATCHING_LIKE_OBSERVED, payload).with_session(session_id);

    if let Err(e) = rabbitmq
        .publish(routing_keys::MATCHING_LIKE_OBSERVED, &event)
        .await
    {
        tracing::error!(error = %e, "failed to publish like.observed event");
    }
}

/// Forward match and like events from the bus to RabbitMQ. In-app alerts
/// and unseen counts are device-local and stay on the bus.
pub fn spawn_forwarder(bus: &EventBus, rabbitmq: RabbitMQClient, session_id: String) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        tracing::info!("event forwarder started");
        loop {
            match rx.recv().await {
                Ok(MatchingEvent::MatchObserved(payload)) => {
                    publish_match_observed(&rabbitmq, &session_id, payload).await;
                }
                Ok(MatchingEvent::LikeObserved(payload)) => {
                    publish_like_observed(&rabbitmq, &session_id, payload).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("event forwarder lagged, skipped {n} events");
                }
                Err(RecvError::Closed) => {
                    tracing::info!("event bus closed, forwarder stopping");
                    break;
                }
            }
        }
    })
}
