use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use mingle_shared::types::event::payloads::{InAppAlert, MatchObserved};
use mingle_shared::{ErrorClass, StoreError, StoreResult};

use super::dedup::{CooldownKey, NotificationDeduper, NotificationKind};
use super::push::PushDispatch;
use crate::events::{EventBus, MatchingEvent};
use crate::models::Like;
use crate::presence::SessionContext;
use crate::profiles::ProfileDirectory;
use crate::retry::RetryPolicy;
use crate::store::{Collection, Field, Filter, RemoteStore, Update};

pub const LIKE_TITLE: &str = "Someone liked you!";
pub const LIKE_BODY: &str = "Someone at the event likes your profile. Like them back to find out who.";
pub const MATCH_TITLE: &str = "It's a match!";

fn match_body(recipient_name: &str, other_name: &str) -> String {
    format!("{recipient_name}, you and {other_name} liked each other. Say hi!")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The recipient's notified flag was already set, possibly by another device.
    AlreadyNotified,
    /// The same notification fired within the cooldown window.
    Cooldown,
    /// An in-app alert for this pair is still on screen.
    AlertActive,
    /// Like pushes are never sent to someone who is in the app.
    RecipientPresent,
    /// The like is already part of a match; the match notification covers it.
    AlreadyMatched,
    /// A like or profile the decision depends on does not exist.
    MissingRecord,
    StoreFailure,
    /// The push gateway rejected the send. The flag stays claimed.
    DispatchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Notified { recipient: String, channel: Channel },
    Suppressed { recipient: String, reason: SuppressReason },
}

impl Decision {
    pub fn recipient(&self) -> &str {
        match self {
            Self::Notified { recipient, .. } | Self::Suppressed { recipient, .. } => recipient,
        }
    }

    pub fn is_notified(&self) -> bool {
        matches!(self, Self::Notified { .. })
    }
}

/// Decides per recipient whether a like or match is announced in-app, by
/// push, or not at all.
///
/// Cheap duplicates are absorbed locally by the deduper. Across devices the
/// recipient's notified flag is claimed with a conditional raise before the
/// channel fires, so only the device whose raise applied notifies.
///
/// Match delivery is therefore at most once: a push that fails after the
/// claim is logged and counted but never retried, and no other device will
/// pick it up.
pub struct NotificationCoordinator {
    store: Arc<dyn RemoteStore>,
    profiles: Arc<dyn ProfileDirectory>,
    push: Arc<dyn PushDispatch>,
    presence: Arc<dyn SessionContext>,
    deduper: Arc<NotificationDeduper>,
    bus: EventBus,
    retry: RetryPolicy,
}

impl NotificationCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        profiles: Arc<dyn ProfileDirectory>,
        push: Arc<dyn PushDispatch>,
        presence: Arc<dyn SessionContext>,
        deduper: Arc<NotificationDeduper>,
        bus: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            profiles,
            push,
            presence,
            deduper,
            bus,
            retry,
        }
    }

    // ── Matches ─────────────────────────────────────────────────────────

    pub async fn on_match(&self, observed: &MatchObserved) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(2);
        for (recipient, other) in [
            (&observed.user_a, &observed.user_b),
            (&observed.user_b, &observed.user_a),
        ] {
            decisions.push(self.notify_match(observed, recipient, other).await);
        }
        decisions
    }

    async fn notify_match(&self, observed: &MatchObserved, recipient: &str, other: &str) -> Decision {
        let pair_id = observed.pair_id.as_str();
        let suppressed = |reason| {
            debug!(pair_id, recipient, ?reason, "match notification suppressed");
            Decision::Suppressed {
                recipient: recipient.to_string(),
                reason,
            }
        };

        let key = CooldownKey::new(NotificationKind::Match, pair_id, recipient);
        if !self.deduper.try_fire(&key) {
            return suppressed(SuppressReason::Cooldown);
        }

        let present = self.presence.is_in_app(recipient);
        if present && self.deduper.is_alert_active(pair_id, recipient) {
            return suppressed(SuppressReason::AlertActive);
        }

        let (outgoing, incoming) = match self.pair_likes(&observed.event_id, recipient, other).await {
            Ok((Some(outgoing), Some(incoming))) => (outgoing, incoming),
            Ok(_) => {
                self.deduper.forget(&key);
                warn!(pair_id, recipient, "match without both likes, skipping");
                return suppressed(SuppressReason::MissingRecord);
            }
            Err(err) => {
                self.deduper.forget(&key);
                return suppressed(self.store_failure(err, pair_id, recipient));
            }
        };

        if outgoing.liker_notified_of_match || incoming.liked_notified_of_match {
            return suppressed(SuppressReason::AlreadyNotified);
        }

        let (recipient_name, other_name) = match self.names(&observed.event_id, recipient, other).await {
            Ok(names) => names,
            Err(err) => {
                self.deduper.forget(&key);
                return suppressed(self.store_failure(err, pair_id, recipient));
            }
        };

        // The recipient's flag lives on their own outgoing like and is
        // mirrored onto the reciprocal in the same batch.
        let store = &self.store;
        let claim = vec![
            Update::raise(Collection::Likes, outgoing.id, Field::LikerNotifiedOfMatch),
            Update::raise(Collection::Likes, incoming.id, Field::LikedNotifiedOfMatch),
        ];
        match self
            .retry
            .run("coordinator.claim_match", move || store.update_many(claim.clone()))
            .await
        {
            Ok(outcomes) if outcomes.first().is_some_and(|o| o.is_applied()) => {}
            Ok(_) => return suppressed(SuppressReason::AlreadyNotified),
            Err(err) => {
                self.deduper.forget(&key);
                return suppressed(self.store_failure(err, pair_id, recipient));
            }
        }

        let body = match_body(&recipient_name, &other_name);
        let channel = if present {
            self.deduper.open_alert(pair_id, recipient);
            self.bus.emit(MatchingEvent::InAppAlert(InAppAlert {
                pair_id: pair_id.to_string(),
                recipient: recipient.to_string(),
                title: MATCH_TITLE.to_string(),
                body,
            }));
            Channel::InApp
        } else {
            let data = json!({
                "type": "match",
                "pair_id": pair_id,
                "event_id": observed.event_id,
            });
            if !self.push.send(recipient, MATCH_TITLE, &body, data).await {
                counter!("notifications_failed_total", "kind" => "match").increment(1);
                warn!(
                    pair_id,
                    recipient,
                    "match push failed after the notified flag was claimed, recipient will not be notified"
                );
                return suppressed(SuppressReason::DispatchFailed);
            }
            Channel::Push
        };

        counter!("notifications_total", "kind" => "match", "channel" => channel.as_str()).increment(1);
        info!(pair_id, recipient, channel = channel.as_str(), "match notification sent");
        Decision::Notified {
            recipient: recipient.to_string(),
            channel,
        }
    }

    /// `L(recipient -> other)` and `L(other -> recipient)` as stored.
    async fn pair_likes(
        &self,
        event_id: &str,
        recipient: &str,
        other: &str,
    ) -> StoreResult<(Option<Like>, Option<Like>)> {
        let outgoing = self.find_like(event_id, recipient, other).await?;
        let incoming = self.find_like(event_id, other, recipient).await?;
        Ok((outgoing, incoming))
    }

    async fn find_like(&self, event_id: &str, liker: &str, liked: &str) -> StoreResult<Option<Like>> {
        let store = &self.store;
        let filters = &[
            Filter::eq(Field::EventId, event_id),
            Filter::eq(Field::LikerSessionId, liker),
            Filter::eq(Field::LikedSessionId, liked),
        ];
        let snapshot = self
            .retry
            .run("coordinator.find_like", move || store.query(Collection::Likes, filters))
            .await?;
        let like = snapshot.likes().next().cloned();
        Ok(like)
    }

    async fn names(&self, event_id: &str, recipient: &str, other: &str) -> StoreResult<(String, String)> {
        let recipient = self.profiles.lookup_by_session(recipient, event_id).await?;
        let other = self.profiles.lookup_by_session(other, event_id).await?;
        Ok((recipient.first_name, other.first_name))
    }

    fn store_failure(&self, err: StoreError, pair_id: &str, recipient: &str) -> SuppressReason {
        warn!(pair_id, recipient, error = %err, class = err.class().as_str(), "match notification skipped");
        match err.class() {
            ErrorClass::DataIntegrity => SuppressReason::MissingRecord,
            _ => SuppressReason::StoreFailure,
        }
    }

    // ── Likes ───────────────────────────────────────────────────────────

    /// Anonymous push to the liked session. Never names the liker.
    pub async fn on_like(&self, like: &Like) -> Decision {
        let recipient = like.liked_session_id.as_str();
        let suppressed = |reason| {
            debug!(like_id = %like.id, recipient, ?reason, "like notification suppressed");
            Decision::Suppressed {
                recipient: recipient.to_string(),
                reason,
            }
        };

        if like.is_mutual {
            return suppressed(SuppressReason::AlreadyMatched);
        }
        if self.presence.is_in_app(recipient) {
            return suppressed(SuppressReason::RecipientPresent);
        }

        let key = CooldownKey::new(NotificationKind::Like, like.id.to_string(), recipient);
        if !self.deduper.try_fire(&key) {
            return suppressed(SuppressReason::Cooldown);
        }

        let data = json!({ "type": "like", "event_id": like.event_id });
        if !self.push.send(recipient, LIKE_TITLE, LIKE_BODY, data).await {
            counter!("notifications_failed_total", "kind" => "like").increment(1);
            warn!(like_id = %like.id, recipient, "like push failed");
            return suppressed(SuppressReason::DispatchFailed);
        }

        counter!("notifications_total", "kind" => "like", "channel" => Channel::Push.as_str()).increment(1);
        info!(like_id = %like.id, recipient, "like notification sent");
        Decision::Notified {
            recipient: recipient.to_string(),
            channel: Channel::Push,
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    pub fn dismiss_alert(&self, pair_id: &str, recipient: &str) -> bool {
        self.deduper.dismiss_alert(pair_id, recipient)
    }

    pub fn reset(&self) {
        self.deduper.clear();
    }
}
