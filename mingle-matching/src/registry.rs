// Listener registry.
//
// Owns every live store subscription of a session, keyed by `(topic, scope)`.
// Each subscription is drained by its own pump task which hands snapshots to a
// synchronous callback. Callbacks run behind a per-entry gate; closing the gate
// waits out a callback already in flight, so once `cancel` returns the pump
// never runs or finishes a callback again.
//
// ────────────────────────────────────────────────────────────────────────────

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mingle_shared::{AppError, ErrorClass, ErrorCode, StoreError};

use crate::store::{ChangeFeed, Collection, Filter, RemoteStore, Snapshot};

// ─── Topics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    OwnProfile,
    PeerProfiles,
    OutgoingLikes,
    IncomingLikes,
    UnseenMessages,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::OwnProfile,
        Topic::PeerProfiles,
        Topic::OutgoingLikes,
        Topic::IncomingLikes,
        Topic::UnseenMessages,
    ];

    /// Topics that only exist while the own profile is visible.
    pub const VISIBILITY_DEPENDENT: [Topic; 3] =
        [Topic::PeerProfiles, Topic::OutgoingLikes, Topic::IncomingLikes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnProfile => "own_profile",
            Self::PeerProfiles => "peer_profiles",
            Self::OutgoingLikes => "outgoing_likes",
            Self::IncomingLikes => "incoming_likes",
            Self::UnseenMessages => "unseen_messages",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub topic: Topic,
    pub scope: String,
}

impl ListenerKey {
    pub fn new(topic: Topic, scope: impl Into<String>) -> Self {
        Self {
            topic,
            scope: scope.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "class", rename_all = "snake_case")]
pub enum ListenerStatus {
    Live,
    /// Inert until explicitly re-subscribed.
    Failed(ErrorClass),
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("unknown listener topic: {0}")]
    UnknownTopic(String),

    #[error("listener {0} is not active for the current profile state")]
    NotActive(Topic),

    #[error("no session is active")]
    NoSession,
}

impl From<ListenerError> for AppError {
    fn from(err: ListenerError) -> Self {
        let code = match &err {
            ListenerError::UnknownTopic(_) => ErrorCode::UnknownListener,
            ListenerError::NotActive(_) => ErrorCode::ListenerDenied,
            ListenerError::NoSession => ErrorCode::ProfileNotFound,
        };
        AppError::new(code, err.to_string())
    }
}

// ─── Subscription spec ──────────────────────────────────────────────────────

pub type ChangeCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// What to subscribe to and where to deliver it.
#[derive(Clone)]
pub struct ListenerSpec {
    pub collection: Collection,
    pub filters: Vec<Filter>,
    pub on_change: ChangeCallback,
    pub on_error: ErrorCallback,
}

// ─── Gate ───────────────────────────────────────────────────────────────────

thread_local! {
    /// Address of the gate whose callback is running on this thread.
    static RUNNING: Cell<usize> = const { Cell::new(0) };
}

/// Serializes callbacks against `close`.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
    running: Mutex<()>,
}

/// Restores the thread's running marker, also on unwind.
struct Running(usize);

impl Drop for Running {
    fn drop(&mut self) {
        RUNNING.with(|r| r.set(self.0));
    }
}

impl Gate {
    fn addr(&self) -> usize {
        self as *const Gate as usize
    }

    /// Run `f` unless the gate is closed. Returns whether it ran.
    fn run(&self, f: impl FnOnce()) -> bool {
        let _running = lock(&self.running);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let _restore = Running(RUNNING.with(|r| r.replace(self.addr())));
        f();
        true
    }

    /// Close the gate and wait for an in-flight callback. A callback closing
    /// its own gate does not wait for itself.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if RUNNING.with(|r| r.get()) != self.addr() {
            drop(lock(&self.running));
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

struct Entry {
    id: u64,
    refs: usize,
    gate: Arc<Gate>,
    status: Arc<Mutex<ListenerStatus>>,
    task: JoinHandle<()>,
}

impl Entry {
    /// Must not be called with the registry lock held: a callback may be
    /// waiting on it.
    fn close(self) {
        self.gate.close();
        self.task.abort();
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ListenerKey, Entry>,
    next_id: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// At most one live subscription per `(topic, scope)`.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct ListenerRegistry {
    store: Arc<dyn RemoteStore>,
    inner: Arc<Mutex<Inner>>,
}

impl ListenerRegistry {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Install a subscription for `key`, tearing down any existing one first.
    pub fn subscribe(&self, key: ListenerKey, spec: ListenerSpec) -> ListenerHandle {
        let replaced = lock(&self.inner).entries.remove(&key);
        if let Some(old) = replaced {
            old.close();
            debug!(topic = %key.topic, scope = %key.scope, "replacing listener");
        }

        let feed = self.store.subscribe(spec.collection, spec.filters.clone());
        let gate = Arc::new(Gate::default());
        let status = Arc::new(Mutex::new(ListenerStatus::Live));
        let task = tokio::spawn(pump(
            key.clone(),
            feed,
            gate.clone(),
            status.clone(),
            spec.on_change,
            spec.on_error,
        ));

        let (id, displaced) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            let displaced = inner.entries.insert(
                key.clone(),
                Entry {
                    id,
                    refs: 1,
                    gate,
                    status,
                    task,
                },
            );
            (id, displaced)
        };
        // A concurrent subscribe for the same key lost the race.
        if let Some(old) = displaced {
            old.close();
        }
        debug!(topic = %key.topic, scope = %key.scope, "listener installed");

        ListenerHandle {
            key,
            id,
            registry: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    /// Attach to an existing subscription instead of creating a duplicate.
    pub fn share(&self, key: &ListenerKey) -> Option<ListenerHandle> {
        let mut inner = lock(&self.inner);
        let entry = inner.entries.get_mut(key)?;
        entry.refs += 1;
        Some(ListenerHandle {
            key: key.clone(),
            id: entry.id,
            registry: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    pub fn status(&self, key: &ListenerKey) -> Option<ListenerStatus> {
        lock(&self.inner)
            .entries
            .get(key)
            .map(|e| *lock(&e.status))
    }

    pub fn contains(&self, key: &ListenerKey) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-cancel the subscription for `key` regardless of outstanding handles.
    pub fn teardown(&self, key: &ListenerKey) -> bool {
        let removed = lock(&self.inner).entries.remove(key);
        match removed {
            Some(entry) => {
                entry.close();
                debug!(topic = %key.topic, scope = %key.scope, "listener torn down");
                true
            }
            None => false,
        }
    }

    pub fn teardown_all(&self) -> usize {
        let entries: Vec<_> = lock(&self.inner).entries.drain().collect();
        let count = entries.len();
        for (_, entry) in entries {
            entry.close();
        }
        if count > 0 {
            info!(count, "all listeners torn down");
        }
        count
    }

    /// Bring the `dependents` of `scope` in line with `desired`: dependents
    /// not desired are torn down, desired topics without an entry are
    /// installed through `factory`. Failed entries are left as they are.
    pub fn reconcile<F>(&self, scope: &str, desired: &[Topic], dependents: &[Topic], mut factory: F) -> Reconciled
    where
        F: FnMut(Topic) -> Option<ListenerSpec>,
    {
        let mut outcome = Reconciled::default();

        for topic in dependents {
            if !desired.contains(topic) && self.teardown(&ListenerKey::new(*topic, scope)) {
                outcome.removed.push(*topic);
            }
        }

        for topic in desired {
            let key = ListenerKey::new(*topic, scope);
            if self.contains(&key) {
                continue;
            }
            if let Some(spec) = factory(*topic) {
                self.subscribe(key, spec);
                outcome.installed.push(*topic);
            }
        }

        if !outcome.installed.is_empty() || !outcome.removed.is_empty() {
            info!(
                scope,
                installed = ?outcome.installed,
                removed = ?outcome.removed,
                "listener set reconciled"
            );
        }
        outcome
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub installed: Vec<Topic>,
    pub removed: Vec<Topic>,
}

async fn pump(
    key: ListenerKey,
    mut feed: ChangeFeed,
    gate: Arc<Gate>,
    status: Arc<Mutex<ListenerStatus>>,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
) {
    while let Some(item) = feed.recv().await {
        match item {
            Ok(snapshot) => {
                if !gate.run(|| on_change(snapshot)) {
                    return;
                }
            }
            Err(err) => {
                gate.run(|| {
                    let class = err.class();
                    *lock(&status) = ListenerStatus::Failed(class);
                    counter!("listener_errors_total", "class" => class.as_str()).increment(1);
                    warn!(
                        topic = %key.topic,
                        scope = %key.scope,
                        class = class.as_str(),
                        error = %err,
                        "listener failed, now inert"
                    );
                    on_error(&err);
                });
                return;
            }
        }
    }
    debug!(topic = %key.topic, scope = %key.scope, "listener feed closed");
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// One reference to a registry entry.
///
/// Cancelling releases the reference; the subscription is torn down when the
/// last reference goes. Cancelling twice, or after the entry was replaced or
/// torn down, does nothing.
pub struct ListenerHandle {
    key: ListenerKey,
    id: u64,
    registry: Weak<Mutex<Inner>>,
    released: AtomicBool,
}

impl ListenerHandle {
    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };

        let closed = {
            let mut inner = lock(&inner);
            let last = match inner.entries.get_mut(&self.key) {
                Some(entry) if entry.id == self.id => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                _ => false,
            };
            if last {
                inner.entries.remove(&self.key)
            } else {
                None
            }
        };

        if let Some(entry) = closed {
            entry.close();
            debug!(topic = %self.key.topic, scope = %self.key.scope, "listener cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Like, Record};
    use crate::store::{Field, InMemoryStore};
    use crate::testing::{profile, settle};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn counting_spec(changes: Arc<AtomicUsize>, errors: Arc<AtomicUsize>) -> ListenerSpec {
        ListenerSpec {
            collection: Collection::Likes,
            filters: vec![Filter::eq(Field::EventId, "ev")],
            on_change: Arc::new(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    async fn add_like(store: &InMemoryStore, from: &str, to: &str) {
        let like = Like::new(&profile("ev", from, from, true), &profile("ev", to, to, true));
        store.create(Record::Like(like)).await.unwrap();
    }

    #[test]
    fn topic_round_trips_through_str() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("nope"), None);
    }

    #[tokio::test]
    async fn resubscribe_replaces_old_subscription() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::OutgoingLikes, "ev:s-ana");

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let old = registry.subscribe(key.clone(), counting_spec(first.clone(), errors.clone()));
        settle().await;
        registry.subscribe(key.clone(), counting_spec(second.clone(), errors.clone()));
        settle().await;

        add_like(&store, "s-ana", "s-ben").await;
        settle().await;

        // Only the initial snapshot reached the replaced listener.
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(store.live_subscriptions(), 1);

        // The stale handle no longer owns the entry.
        old.cancel();
        assert!(registry.contains(&key));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_callbacks() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::IncomingLikes, "ev:s-ben");
        let changes = Arc::new(AtomicUsize::new(0));

        let handle = registry.subscribe(key.clone(), counting_spec(changes.clone(), Arc::default()));
        settle().await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        handle.cancel();
        handle.cancel();
        assert!(handle.is_released());
        assert!(!registry.contains(&key));

        add_like(&store, "s-ana", "s-ben").await;
        settle().await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_waits_for_a_running_callback() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::PeerProfiles, "ev:s-ana");
        let mutations = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();

        let counted = mutations.clone();
        let spec = ListenerSpec {
            collection: Collection::Likes,
            filters: vec![Filter::eq(Field::EventId, "ev")],
            on_change: Arc::new(move |_| {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(50));
                counted.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(|_| {}),
        };

        let handle = registry.subscribe(key, spec);
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();
        assert_eq!(mutations.load(Ordering::SeqCst), 1);

        add_like(&store, "s-ana", "s-ben").await;
        settle().await;
        assert_eq!(mutations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_can_tear_down_its_own_listener() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::OwnProfile, "ev:s-ana");
        let calls = Arc::new(AtomicUsize::new(0));

        let (own, own_key, counted) = (registry.clone(), key.clone(), calls.clone());
        let spec = ListenerSpec {
            collection: Collection::Likes,
            filters: vec![Filter::eq(Field::EventId, "ev")],
            on_change: Arc::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                own.teardown(&own_key);
            }),
            on_error: Arc::new(|_| {}),
        };

        registry.subscribe(key.clone(), spec);
        settle().await;
        add_like(&store, "s-ana", "s-ben").await;
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&key));
    }

    #[tokio::test]
    async fn shared_entries_close_with_the_last_reference() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::PeerProfiles, "ev:s-ana");

        let owner = registry.subscribe(key.clone(), counting_spec(Arc::default(), Arc::default()));
        let mounted = registry.share(&key).unwrap();
        assert_eq!(store.call_count(crate::store::StoreOp::Subscribe), 1);

        owner.cancel();
        assert!(registry.contains(&key));
        mounted.cancel();
        assert!(!registry.contains(&key));
        assert!(registry.share(&key).is_none());
    }

    #[tokio::test]
    async fn permission_errors_leave_listener_inert() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        let key = ListenerKey::new(Topic::IncomingLikes, "ev:s-ben");
        let changes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        registry.subscribe(key.clone(), counting_spec(changes.clone(), errors.clone()));
        settle().await;
        store.deny_subscriptions(Collection::Likes);
        settle().await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.status(&key),
            Some(ListenerStatus::Failed(ErrorClass::Permission))
        );

        // No automatic retry: nothing resubscribed.
        assert_eq!(store.call_count(crate::store::StoreOp::Subscribe), 1);

        store.allow_subscriptions(Collection::Likes);
        registry.subscribe(key.clone(), counting_spec(changes.clone(), errors.clone()));
        settle().await;
        assert_eq!(registry.status(&key), Some(ListenerStatus::Live));
    }

    #[tokio::test]
    async fn reconcile_follows_desired_set() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store));
        let scope = "ev:s-ana";
        let factory = |_| Some(counting_spec(Arc::default(), Arc::default()));

        let all = Topic::VISIBILITY_DEPENDENT;
        let outcome = registry.reconcile(scope, &all, &all, factory);
        assert_eq!(outcome.installed.len(), 3);

        let again = registry.reconcile(scope, &all, &all, factory);
        assert_eq!(again, Reconciled::default());

        let hidden = registry.reconcile(scope, &[], &all, factory);
        assert_eq!(hidden.removed.len(), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn teardown_all_clears_every_entry() {
        let store = InMemoryStore::new();
        let registry = ListenerRegistry::new(Arc::new(store.clone()));
        for topic in Topic::ALL {
            registry.subscribe(
                ListenerKey::new(topic, "ev:s-ana"),
                counting_spec(Arc::default(), Arc::default()),
            );
        }
        assert_eq!(registry.teardown_all(), 5);
        assert_eq!(registry.teardown_all(), 0);
        settle().await;
        assert_eq!(store.live_subscriptions(), 0);
    }
}
