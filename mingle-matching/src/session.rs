// Matching session.
//
// Wires the registry, detector, coordinator and reconciler for one
// `(event_id, session_id)` scope. Listener callbacks update the caches
// synchronously and spawn the remote follow-up work; everything the session
// owns is dropped again on logout.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mingle_shared::types::event::payloads::{LikeObserved, MatchObserved, UnseenMessages};
use mingle_shared::{AppError, AppResult, ErrorCode, StoreError, StoreErrorKind};

use crate::events::{EventBus, MatchingEvent};
use crate::matching::detector::observed_match;
use crate::matching::{Detection, MatchDetector};
use crate::models::{Like, Profile};
use crate::notify::{Clock, NotificationCoordinator, NotificationDeduper, PushDispatch};
use crate::presence::LocalSession;
use crate::profiles::ProfileDirectory;
use crate::reconciler::{LikeError, LikeReconciler};
use crate::registry::{
    ChangeCallback, ErrorCallback, ListenerError, ListenerKey, ListenerRegistry, ListenerSpec,
    ListenerStatus, Topic,
};
use crate::retry::RetryPolicy;
use crate::store::{Collection, Field, Filter, RemoteStore, Snapshot};

/// Listener topics wanted for a given own-profile visibility.
pub fn desired_listeners(is_visible: bool) -> Vec<Topic> {
    let mut topics = vec![Topic::OwnProfile, Topic::UnseenMessages];
    if is_visible {
        topics.extend(Topic::VISIBILITY_DEPENDENT);
    }
    topics
}

fn like_observed(like: &Like) -> LikeObserved {
    LikeObserved {
        like_id: like.id,
        event_id: like.event_id.clone(),
        from: like.liker_session_id.clone(),
        to: like.liked_session_id.clone(),
        is_mutual: like.is_mutual,
    }
}

/// Replace `cache` with the likes in `snapshot`, returning those that are new
/// or differ from the cached copy.
fn absorb(cache: &mut HashMap<Uuid, Like>, snapshot: &Snapshot) -> Vec<Like> {
    let next: HashMap<Uuid, Like> = snapshot.likes().map(|l| (l.id, l.clone())).collect();
    let changed = next
        .values()
        .filter(|l| cache.get(&l.id) != Some(*l))
        .cloned()
        .collect();
    *cache = next;
    changed
}

/// Everything a session needs from the outside.
pub struct SessionDeps {
    pub store: Arc<dyn RemoteStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub push: Arc<dyn PushDispatch>,
    pub presence: Arc<LocalSession>,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub cooldown: Duration,
    pub retry: RetryPolicy,
    /// `None` disables the periodic re-check.
    pub recheck_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerState {
    pub topic: Topic,
    pub status: ListenerStatus,
}

#[derive(Default)]
struct SessionState {
    active: bool,
    own_profile: Option<Profile>,
    /// Every other profile in the event, visible or not, keyed by session id.
    peers: HashMap<String, Profile>,
    outgoing: HashMap<Uuid, Like>,
    incoming: HashMap<Uuid, Like>,
    announced_incoming: HashSet<Uuid>,
    unseen: usize,
    recheck: Option<JoinHandle<()>>,
}

pub struct MatchingSession {
    event_id: String,
    session_id: String,
    scope: String,
    me: Weak<MatchingSession>,
    store: Arc<dyn RemoteStore>,
    profiles: Arc<dyn ProfileDirectory>,
    presence: Arc<LocalSession>,
    bus: EventBus,
    retry: RetryPolicy,
    recheck_interval: Option<Duration>,
    registry: ListenerRegistry,
    detector: MatchDetector,
    coordinator: NotificationCoordinator,
    reconciler: LikeReconciler,
    state: Mutex<SessionState>,
}

impl MatchingSession {
    pub fn new(event_id: impl Into<String>, session_id: impl Into<String>, deps: SessionDeps) -> Arc<Self> {
        let event_id = event_id.into();
        let session_id = session_id.into();
        let deduper = Arc::new(NotificationDeduper::new(deps.clock, deps.cooldown));

        Arc::new_cyclic(|me| Self {
            scope: format!("{event_id}:{session_id}"),
            event_id,
            session_id,
            me: me.clone(),
            registry: ListenerRegistry::new(deps.store.clone()),
            detector: MatchDetector::new(deps.store.clone(), deps.retry.clone()),
            coordinator: NotificationCoordinator::new(
                deps.store.clone(),
                deps.profiles.clone(),
                deps.push,
                deps.presence.clone(),
                deduper,
                deps.bus.clone(),
                deps.retry.clone(),
            ),
            reconciler: LikeReconciler::new(deps.store.clone(), deps.retry.clone()),
            store: deps.store,
            profiles: deps.profiles,
            presence: deps.presence,
            bus: deps.bus,
            retry: deps.retry,
            recheck_interval: deps.recheck_interval,
            state: Mutex::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, topic: Topic) -> ListenerKey {
        ListenerKey::new(topic, self.scope.as_str())
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Load the own profile and install the listeners for it.
    pub async fn start(&self) -> AppResult<Profile> {
        let own = match self
            .profiles
            .lookup_by_session(&self.session_id, &self.event_id)
            .await
        {
            Ok(profile) => profile,
            Err(err) if err.kind == StoreErrorKind::NotFound => {
                warn!(session_id = %self.session_id, event_id = %self.event_id, "own profile not found");
                return Err(AppError::new(
                    ErrorCode::ProfileNotFound,
                    format!("no profile for session {} in event {}", self.session_id, self.event_id),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        self.presence.sign_in(&self.session_id);
        {
            let mut state = self.lock();
            state.active = true;
            state.own_profile = Some(own.clone());
        }

        for topic in [Topic::OwnProfile, Topic::UnseenMessages] {
            if let Some(spec) = self.listener_spec(topic) {
                self.registry.subscribe(self.key(topic), spec);
            }
        }
        self.sync_listeners(own.is_visible);
        self.spawn_recheck();

        info!(
            session_id = %self.session_id,
            event_id = %self.event_id,
            visible = own.is_visible,
            "matching session started"
        );
        Ok(own)
    }

    /// Tear down every listener and drop all session-local state.
    pub fn logout(&self) {
        let recheck = {
            let mut state = self.lock();
            let recheck = state.recheck.take();
            *state = SessionState::default();
            recheck
        };
        if let Some(task) = recheck {
            task.abort();
        }

        let removed = self.registry.teardown_all();
        self.coordinator.reset();
        self.reconciler.reset();
        self.presence.sign_out();
        info!(session_id = %self.session_id, removed, "matching session logged out");
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.presence.set_foreground(foreground);
        debug!(foreground, "app presence changed");
    }

    // ── Listeners ───────────────────────────────────────────────────────

    fn sync_listeners(&self, is_visible: bool) {
        let desired = desired_listeners(is_visible);
        let outcome = self.registry.reconcile(
            &self.scope,
            &desired,
            &Topic::VISIBILITY_DEPENDENT,
            |topic| self.listener_spec(topic),
        );
        if !outcome.removed.is_empty() {
            let mut state = self.lock();
            state.peers.clear();
            state.outgoing.clear();
            state.incoming.clear();
        }
    }

    fn listener_spec(&self, topic: Topic) -> Option<ListenerSpec> {
        let own_id = self.lock().own_profile.as_ref().map(|p| p.id);
        let event = Filter::eq(Field::EventId, self.event_id.as_str());
        let session = self.session_id.as_str();

        let (collection, filters) = match topic {
            Topic::OwnProfile => (
                Collection::Profiles,
                vec![event, Filter::eq(Field::SessionId, session)],
            ),
            Topic::PeerProfiles => (Collection::Profiles, vec![event]),
            Topic::OutgoingLikes => (
                Collection::Likes,
                vec![event, Filter::eq(Field::LikerSessionId, session)],
            ),
            Topic::IncomingLikes => (
                Collection::Likes,
                vec![event, Filter::eq(Field::LikedSessionId, session)],
            ),
            Topic::UnseenMessages => (
                Collection::Messages,
                vec![
                    event,
                    Filter::eq(Field::ToProfileId, own_id?),
                    Filter::eq(Field::Seen, false),
                ],
            ),
        };

        let me = self.me.clone();
        let on_change: ChangeCallback = Arc::new(move |snapshot: Snapshot| {
            if let Some(session) = me.upgrade() {
                session.on_snapshot(topic, snapshot);
            }
        });
        let me = self.me.clone();
        let on_error: ErrorCallback = Arc::new(move |err: &StoreError| {
            if let Some(session) = me.upgrade() {
                session.on_listener_error(topic, err);
            }
        });

        Some(ListenerSpec {
            collection,
            filters,
            on_change,
            on_error,
        })
    }

    fn on_snapshot(&self, topic: Topic, snapshot: Snapshot) {
        let mut state = self.lock();
        if !state.active {
            return;
        }
        let visible = state.own_profile.as_ref().is_some_and(|p| p.is_visible);
        if !visible && Topic::VISIBILITY_DEPENDENT.contains(&topic) {
            debug!(topic = %topic, "dropping snapshot while invisible");
            return;
        }

        match topic {
            Topic::OwnProfile => {
                let Some(own) = snapshot
                    .profiles()
                    .find(|p| p.session_id == self.session_id)
                    .cloned()
                else {
                    warn!(session_id = %self.session_id, "own profile missing from snapshot");
                    return;
                };
                let visible = own.is_visible;
                state.own_profile = Some(own);
                drop(state);
                self.sync_listeners(visible);
            }
            Topic::PeerProfiles => {
                state.peers = snapshot
                    .profiles()
                    .filter(|p| p.session_id != self.session_id)
                    .map(|p| (p.session_id.clone(), p.clone()))
                    .collect();
            }
            Topic::OutgoingLikes => {
                let changed = absorb(&mut state.outgoing, &snapshot);
                self.reconciler
                    .apply_snapshot(state.outgoing.values().map(|l| l.liked_session_id.clone()));
                drop(state);
                for like in changed {
                    self.follow_up(like);
                }
            }
            Topic::IncomingLikes => {
                let changed = absorb(&mut state.incoming, &snapshot);
                let fresh: Vec<LikeObserved> = changed
                    .iter()
                    .filter(|l| state.announced_incoming.insert(l.id))
                    .map(like_observed)
                    .collect();
                drop(state);
                for payload in fresh {
                    self.bus.emit(MatchingEvent::LikeObserved(payload));
                }
                for like in changed {
                    self.follow_up(like);
                }
            }
            Topic::UnseenMessages => {
                let count = snapshot.messages().filter(|m| !m.seen).count();
                if count == state.unseen {
                    return;
                }
                state.unseen = count;
                drop(state);
                self.bus.emit(MatchingEvent::UnseenMessages(UnseenMessages {
                    session_id: self.session_id.clone(),
                    count,
                }));
            }
        }
    }

    fn on_listener_error(&self, topic: Topic, err: &StoreError) {
        warn!(
            session_id = %self.session_id,
            topic = %topic,
            class = err.class().as_str(),
            "listener stopped, waiting for explicit retry"
        );
    }

    /// Re-install a failed or missing listener.
    pub fn retry_listener(&self, topic: Topic) -> Result<ListenerStatus, ListenerError> {
        let visible = {
            let state = self.lock();
            if !state.active {
                return Err(ListenerError::NoSession);
            }
            state.own_profile.as_ref().is_some_and(|p| p.is_visible)
        };
        if !desired_listeners(visible).contains(&topic) {
            return Err(ListenerError::NotActive(topic));
        }

        let spec = self.listener_spec(topic).ok_or(ListenerError::NoSession)?;
        let key = self.key(topic);
        self.registry.subscribe(key.clone(), spec);
        info!(topic = %topic, "listener re-subscribed");
        Ok(self.registry.status(&key).unwrap_or(ListenerStatus::Live))
    }

    pub fn listener_status(&self) -> Vec<ListenerState> {
        Topic::ALL
            .into_iter()
            .filter_map(|topic| {
                self.registry
                    .status(&self.key(topic))
                    .map(|status| ListenerState { topic, status })
            })
            .collect()
    }

    // ── Likes & matches ─────────────────────────────────────────────────

    /// Like the profile of `target_session`.
    pub async fn like(&self, target_session: &str) -> Result<Like, LikeError> {
        let (me, target) = {
            let state = self.lock();
            let me = state
                .own_profile
                .clone()
                .filter(|_| state.active)
                .ok_or(LikeError::ProfileMissing)?;
            if target_session == self.session_id {
                return Err(LikeError::SelfLike);
            }
            let target = state
                .peers
                .get(target_session)
                .cloned()
                .ok_or_else(|| LikeError::UnknownProfile(target_session.to_string()))?;
            (me, target)
        };

        // An already stored like is not announced again, but detection still
        // runs so a half-written pair can heal.
        let outcome = self.reconciler.like_action(&me, &target).await?;
        let created = outcome.is_created();
        let mut like = outcome.into_like();
        if created {
            self.bus.emit(MatchingEvent::LikeObserved(like_observed(&like)));
        }

        match self.process_like(&like).await {
            Some(Detection::NoReciprocal) if created => {
                self.coordinator.on_like(&like).await;
            }
            Some(Detection::NoReciprocal) | None => {}
            Some(_) => like.is_mutual = true,
        }
        Ok(like)
    }

    /// Run detection for `like` and announce any match it reveals.
    async fn process_like(&self, like: &Like) -> Option<Detection> {
        if !self.is_active() {
            return None;
        }
        match self.detector.observe(like).await {
            Ok(detection) => {
                match &detection {
                    Detection::Matched(observed) => {
                        self.bus.emit(MatchingEvent::MatchObserved(observed.clone()));
                        self.announce(observed).await;
                    }
                    Detection::AlreadyMatched(observed) => self.announce(observed).await,
                    Detection::NoReciprocal => {}
                }
                Some(detection)
            }
            Err(err) => {
                warn!(
                    like_id = %like.id,
                    class = err.class().as_str(),
                    error = %err,
                    "match detection failed"
                );
                None
            }
        }
    }

    async fn announce(&self, observed: &MatchObserved) {
        if !self.is_active() {
            return;
        }
        let decisions = self.coordinator.on_match(observed).await;
        debug!(pair_id = %observed.pair_id, ?decisions, "match announced");
    }

    /// Spawn detection or a pending match notification for a like seen on a
    /// listener.
    fn follow_up(&self, like: Like) {
        if like.is_mutual && like.liker_notified_of_match && like.liked_notified_of_match {
            return;
        }
        let Some(session) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if like.is_mutual {
                session.announce(&observed_match(&like)).await;
            } else {
                session.process_like(&like).await;
            }
        });
    }

    /// Re-run detection over the outgoing likes in the store. Returns how many
    /// of them belong to a match.
    pub async fn recheck(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        let store = &self.store;
        let filters = &[
            Filter::eq(Field::EventId, self.event_id.as_str()),
            Filter::eq(Field::LikerSessionId, self.session_id.as_str()),
        ];
        let snapshot = match self
            .retry
            .run("session.recheck", move || store.query(Collection::Likes, filters))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(class = err.class().as_str(), error = %err, "re-check query failed");
                return 0;
            }
        };

        let mut matched = 0;
        for like in snapshot.likes() {
            if like.is_mutual && like.liker_notified_of_match && like.liked_notified_of_match {
                matched += 1;
                continue;
            }
            if let Some(detection) = self.process_like(like).await {
                if detection.observed().is_some() {
                    matched += 1;
                }
            }
        }
        debug!(session_id = %self.session_id, matched, "re-check finished");
        matched
    }

    fn spawn_recheck(&self) {
        let Some(period) = self.recheck_interval else {
            return;
        };
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = me.upgrade() else {
                    break;
                };
                session.recheck().await;
            }
        });
        if let Some(old) = self.lock().recheck.replace(task) {
            old.abort();
        }
    }

    pub fn dismiss_alert(&self, pair_id: &str) -> bool {
        self.coordinator.dismiss_alert(pair_id, &self.session_id)
    }

    // ── Read models ─────────────────────────────────────────────────────

    pub fn own_profile(&self) -> Option<Profile> {
        self.lock().own_profile.clone()
    }

    /// Liked session ids, including optimistic entries.
    pub fn liked(&self) -> Vec<String> {
        self.reconciler.liked()
    }

    /// Visible peers, ordered by session id.
    pub fn peers(&self) -> Vec<Profile> {
        let mut peers: Vec<Profile> = self
            .lock()
            .peers
            .values()
            .filter(|p| p.is_visible)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        peers
    }

    pub fn incoming_count(&self) -> usize {
        self.lock().incoming.len()
    }

    pub fn unseen_count(&self) -> usize {
        self.lock().unseen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Record};
    use crate::notify::coordinator::{LIKE_BODY, LIKE_TITLE, MATCH_TITLE};
    use crate::notify::ManualClock;
    use crate::profiles::StoreProfileDirectory;
    use crate::store::{InMemoryStore, Patch, StoreOp};
    use crate::testing::{profile, quick_retry, settle, RecordingPush};
    use chrono::Utc;
    use tokio::sync::broadcast;

    struct Device {
        session: Arc<MatchingSession>,
        push: Arc<RecordingPush>,
        rx: broadcast::Receiver<MatchingEvent>,
    }

    impl Device {
        fn events(&mut self) -> Vec<MatchingEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn device(store: &InMemoryStore, session_id: &str) -> Device {
        let shared: Arc<dyn RemoteStore> = Arc::new(store.clone());
        let push = Arc::new(RecordingPush::default());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let session = MatchingSession::new(
            "ev",
            session_id,
            SessionDeps {
                store: shared.clone(),
                profiles: Arc::new(StoreProfileDirectory::new(shared, quick_retry())),
                push: push.clone(),
                presence: Arc::new(LocalSession::new()),
                bus,
                clock: Arc::new(ManualClock::new()),
                cooldown: Duration::from_secs(5),
                retry: quick_retry(),
                recheck_interval: None,
            },
        );
        Device { session, push, rx }
    }

    async fn seed(store: &InMemoryStore, session_id: &str, name: &str, visible: bool) -> Profile {
        let p = profile("ev", session_id, name, visible);
        store.create(Record::Profile(p.clone())).await.unwrap();
        p
    }

    async fn started(store: &InMemoryStore, session_id: &str) -> Device {
        let d = device(store, session_id);
        d.session.start().await.unwrap();
        settle().await;
        d
    }

    fn stored_likes(store: &InMemoryStore) -> Vec<Like> {
        store
            .records(Collection::Likes)
            .iter()
            .filter_map(|r| r.as_like().cloned())
            .collect()
    }

    #[test]
    fn dependent_listeners_follow_visibility() {
        assert_eq!(
            desired_listeners(false),
            vec![Topic::OwnProfile, Topic::UnseenMessages]
        );
        let visible = desired_listeners(true);
        for topic in Topic::ALL {
            assert!(visible.contains(&topic));
        }
    }

    #[tokio::test]
    async fn start_without_profile_reports_profile_not_found() {
        let store = InMemoryStore::new();
        let d = device(&store, "s-ghost");

        let err = d.session.start().await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProfileNotFound);
        assert!(!d.session.is_active());
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn one_sided_like_sends_anonymous_push() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", true).await;
        let ana = started(&store, "s-ana").await;

        let like = ana.session.like("s-ben").await.unwrap();
        settle().await;

        assert!(!like.is_mutual);
        assert_eq!(stored_likes(&store).len(), 1);
        let pushes = ana.push.sent_to("s-ben");
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].title, LIKE_TITLE);
        assert_eq!(pushes[0].body, LIKE_BODY);
        assert!(!pushes[0].body.contains("Ana"));
        assert_eq!(ana.session.liked(), vec!["s-ben".to_string()]);
    }

    #[tokio::test]
    async fn mutual_like_matches_and_notifies_each_side_once() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", true).await;
        let ana = started(&store, "s-ana").await;
        let ben = started(&store, "s-ben").await;

        ana.session.like("s-ben").await.unwrap();
        settle().await;
        let like = ben.session.like("s-ana").await.unwrap();
        settle().await;
        settle().await;

        assert!(like.is_mutual);
        let likes = stored_likes(&store);
        assert_eq!(likes.len(), 2);
        for l in &likes {
            assert!(l.is_mutual);
            assert!(l.liker_notified_of_match);
            assert!(l.liked_notified_of_match);
        }

        let pushes: Vec<_> = [&ana, &ben]
            .iter()
            .flat_map(|d| d.push.sent())
            .filter(|p| p.title == MATCH_TITLE)
            .collect();
        for p in &pushes {
            assert!(p.body.contains("Ana") && p.body.contains("Ben"));
        }
        assert!(ana.push.sent_to("s-ben").iter().any(|p| p.title == LIKE_TITLE));
    }

    #[tokio::test]
    async fn each_recipient_notified_once_across_devices() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", true).await;
        let mut ana = started(&store, "s-ana").await;
        let mut ben = started(&store, "s-ben").await;

        ana.session.like("s-ben").await.unwrap();
        ben.session.like("s-ana").await.unwrap();
        settle().await;
        settle().await;
        ana.session.recheck().await;
        ben.session.recheck().await;
        settle().await;

        // Events are drained per call, so collect both recipients in one pass.
        let mut ana_count = 0;
        let mut ben_count = 0;
        for d in [&mut ana, &mut ben] {
            for p in d.push.sent().iter().filter(|p| p.title == MATCH_TITLE) {
                match p.to.as_str() {
                    "s-ana" => ana_count += 1,
                    "s-ben" => ben_count += 1,
                    other => panic!("unexpected recipient {other}"),
                }
            }
            for event in d.events() {
                if let MatchingEvent::InAppAlert(alert) = event {
                    match alert.recipient.as_str() {
                        "s-ana" => ana_count += 1,
                        "s-ben" => ben_count += 1,
                        other => panic!("unexpected recipient {other}"),
                    }
                }
            }
        }
        assert_eq!(ana_count, 1);
        assert_eq!(ben_count, 1);
    }

    #[tokio::test]
    async fn like_of_invisible_profile_is_rejected_without_remote_call() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", false).await;
        let ana = started(&store, "s-ana").await;
        let queries = store.call_count(StoreOp::Query);

        let err = ana.session.like("s-ben").await.unwrap_err();
        assert!(matches!(err, LikeError::Invisible));
        assert_eq!(store.call_count(StoreOp::Query), queries);
        assert_eq!(store.call_count(StoreOp::Create), 2);
        assert!(ana.session.liked().is_empty());
        assert!(ana.session.peers().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_self_targets_are_rejected() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        let ana = started(&store, "s-ana").await;

        assert!(matches!(ana.session.like("s-ana").await, Err(LikeError::SelfLike)));
        assert!(matches!(
            ana.session.like("s-nobody").await,
            Err(LikeError::UnknownProfile(_))
        ));
    }

    #[tokio::test]
    async fn reciprocal_likes_written_elsewhere_become_mutual() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        let ben_profile = seed(&store, "s-ben", "Ben", true).await;
        store
            .create(Record::Like(Like::new(&ana_profile, &ben_profile)))
            .await
            .unwrap();
        store
            .create(Record::Like(Like::new(&ben_profile, &ana_profile)))
            .await
            .unwrap();

        let _ana = started(&store, "s-ana").await;
        settle().await;

        assert!(stored_likes(&store).iter().all(|l| l.is_mutual));
    }

    #[tokio::test]
    async fn failed_like_rolls_back_liked_set() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", true).await;
        let ana = started(&store, "s-ana").await;

        store.fail_next(StoreOp::Create, StoreErrorKind::PermissionDenied);
        let err = ana.session.like("s-ben").await.unwrap_err();

        assert!(err.is_retryable());
        assert!(ana.session.liked().is_empty());
        assert!(stored_likes(&store).is_empty());
    }

    #[tokio::test]
    async fn liking_an_already_stored_pair_announces_nothing() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        let ben_profile = seed(&store, "s-ben", "Ben", true).await;
        let mut ana = started(&store, "s-ana").await;

        // Likes written while the like listeners are down never reach the
        // local liked set.
        store.deny_subscriptions(Collection::Likes);
        settle().await;
        let earlier = Like::new(&ana_profile, &ben_profile);
        store.create(Record::Like(earlier.clone())).await.unwrap();
        settle().await;
        ana.events();
        assert!(ana.session.liked().is_empty());

        let like = ana.session.like("s-ben").await.unwrap();
        settle().await;

        assert_eq!(like.id, earlier.id);
        assert_eq!(stored_likes(&store).len(), 1);
        assert!(ana.push.sent_to("s-ben").is_empty());
        assert!(!ana
            .events()
            .iter()
            .any(|e| matches!(e, MatchingEvent::LikeObserved(_))));
        assert_eq!(ana.session.liked(), vec!["s-ben".to_string()]);
    }

    #[tokio::test]
    async fn incoming_likes_are_announced_once() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        let cat_profile = seed(&store, "s-cat", "Cat", true).await;
        let mut ana = started(&store, "s-ana").await;
        ana.events();

        let like = Like::new(&cat_profile, &ana_profile);
        store.create(Record::Like(like.clone())).await.unwrap();
        settle().await;
        store
            .update(Collection::Likes, like.id, Patch::raise(Field::LikedNotifiedOfMatch))
            .await
            .unwrap();
        settle().await;

        let observed: Vec<_> = ana
            .events()
            .into_iter()
            .filter(|e| matches!(e, MatchingEvent::LikeObserved(l) if l.like_id == like.id))
            .collect();
        assert_eq!(observed.len(), 1);
        assert_eq!(ana.session.incoming_count(), 1);
    }

    #[tokio::test]
    async fn unseen_message_count_is_emitted_on_change() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        let ben_profile = seed(&store, "s-ben", "Ben", true).await;
        let mut ana = started(&store, "s-ana").await;
        ana.events();

        let message = Message {
            id: Uuid::new_v4(),
            event_id: "ev".into(),
            from_profile_id: ben_profile.id,
            to_profile_id: ana_profile.id,
            content: "hi".into(),
            created_at: Utc::now(),
            seen: false,
        };
        store.create(Record::Message(message.clone())).await.unwrap();
        settle().await;
        assert_eq!(ana.session.unseen_count(), 1);

        store
            .update(Collection::Messages, message.id, Patch::raise(Field::Seen))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ana.session.unseen_count(), 0);

        let counts: Vec<usize> = ana
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MatchingEvent::UnseenMessages(u) => Some(u.count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[tokio::test]
    async fn visibility_change_cascades_to_dependent_listeners() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-ben", "Ben", true).await;
        let ana = started(&store, "s-ana").await;
        assert_eq!(ana.session.listener_status().len(), 5);
        assert_eq!(ana.session.peers().len(), 1);

        store
            .update(
                Collection::Profiles,
                ana_profile.id,
                Patch::new().set(Field::IsVisible, false),
            )
            .await
            .unwrap();
        settle().await;

        let topics: Vec<Topic> = ana.session.listener_status().iter().map(|s| s.topic).collect();
        assert_eq!(topics, vec![Topic::OwnProfile, Topic::UnseenMessages]);
        assert!(ana.session.peers().is_empty());
        assert!(matches!(
            ana.session.retry_listener(Topic::PeerProfiles),
            Err(ListenerError::NotActive(Topic::PeerProfiles))
        ));

        store
            .update(
                Collection::Profiles,
                ana_profile.id,
                Patch::new().set(Field::IsVisible, true),
            )
            .await
            .unwrap();
        settle().await;

        assert_eq!(ana.session.listener_status().len(), 5);
        assert_eq!(ana.session.peers().len(), 1);
    }

    #[tokio::test]
    async fn denied_listener_stays_failed_until_retried() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        let ana = started(&store, "s-ana").await;

        store.deny_subscriptions(Collection::Likes);
        settle().await;
        let failed: Vec<Topic> = ana
            .session
            .listener_status()
            .iter()
            .filter(|s| matches!(s.status, ListenerStatus::Failed(_)))
            .map(|s| s.topic)
            .collect();
        assert_eq!(failed, vec![Topic::OutgoingLikes, Topic::IncomingLikes]);

        store.allow_subscriptions(Collection::Likes);
        assert_eq!(
            ana.session.retry_listener(Topic::OutgoingLikes).unwrap(),
            ListenerStatus::Live
        );
        settle().await;
        assert!(ana
            .session
            .listener_status()
            .contains(&ListenerState {
                topic: Topic::OutgoingLikes,
                status: ListenerStatus::Live
            }));
    }

    #[tokio::test]
    async fn logout_stops_callbacks_and_clears_state() {
        let store = InMemoryStore::new();
        let ana_profile = seed(&store, "s-ana", "Ana", true).await;
        let cat_profile = seed(&store, "s-cat", "Cat", true).await;
        let mut ana = started(&store, "s-ana").await;
        ana.session.like("s-cat").await.unwrap();
        settle().await;

        ana.session.logout();
        ana.events();
        settle().await;
        assert_eq!(store.live_subscriptions(), 0);

        store
            .create(Record::Like(Like::new(&cat_profile, &ana_profile)))
            .await
            .unwrap();
        settle().await;

        assert!(ana.events().is_empty());
        assert!(!ana.session.is_active());
        assert!(ana.session.liked().is_empty());
        assert!(ana.session.own_profile().is_none());
        assert!(ana.session.listener_status().is_empty());
        assert_eq!(ana.session.recheck().await, 0);
        assert!(matches!(
            ana.session.like("s-cat").await,
            Err(LikeError::ProfileMissing)
        ));
        assert!(matches!(
            ana.session.retry_listener(Topic::OwnProfile),
            Err(ListenerError::NoSession)
        ));
        let mutual = stored_likes(&store).iter().filter(|l| l.is_mutual).count();
        assert_eq!(mutual, 0);
    }

    #[tokio::test]
    async fn session_restarts_after_logout() {
        let store = InMemoryStore::new();
        seed(&store, "s-ana", "Ana", true).await;
        seed(&store, "s-cat", "Cat", true).await;
        let ana = started(&store, "s-ana").await;
        ana.session.like("s-cat").await.unwrap();
        ana.session.logout();
        settle().await;

        let own = ana.session.start().await.unwrap();
        settle().await;

        assert_eq!(own.session_id, "s-ana");
        assert!(ana.session.is_active());
        assert_eq!(ana.session.liked(), vec!["s-cat".to_string()]);
        assert_eq!(ana.session.listener_status().len(), Topic::ALL.len());
        assert_eq!(store.live_subscriptions(), Topic::ALL.len());
    }
}
