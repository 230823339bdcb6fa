use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use mingle_shared::{StoreError, StoreErrorKind, StoreResult};

use super::{
    matches_all, ChangeFeed, Collection, Filter, Patch, RemoteStore, Snapshot, Update, UpdateOutcome,
};
use crate::models::Record;

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Update,
    Query,
    Subscribe,
}

struct Watcher {
    collection: Collection,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<StoreResult<Snapshot>>,
    last: Snapshot,
}

#[derive(Default)]
struct State {
    records: HashMap<Collection, Vec<Record>>,
    watchers: Vec<Watcher>,
    failures: HashMap<StoreOp, VecDeque<StoreErrorKind>>,
    denied: HashSet<Collection>,
    calls: HashMap<StoreOp, usize>,
}

impl State {
    /// Count the call and pop a queued failure for it, if any.
    fn enter(&mut self, op: StoreOp) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(kind) => Err(StoreError::new(kind, format!("injected failure on {op:?}"))),
            None => Ok(()),
        }
    }

    fn snapshot(&self, collection: Collection, filters: &[Filter]) -> Snapshot {
        let records = self
            .records
            .get(&collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches_all(filters, r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Snapshot::new(records)
    }

    fn find_mut(&mut self, collection: Collection, id: Uuid) -> Option<&mut Record> {
        self.records
            .get_mut(&collection)
            .and_then(|records| records.iter_mut().find(|r| r.id() == id))
    }

    fn contains(&self, collection: Collection, id: Uuid) -> bool {
        self.records
            .get(&collection)
            .is_some_and(|records| records.iter().any(|r| r.id() == id))
    }

    fn apply(&mut self, collection: Collection, id: Uuid, patch: &Patch) -> StoreResult<UpdateOutcome> {
        let record = self
            .find_mut(collection, id)
            .ok_or_else(|| StoreError::not_found(format!("{collection}/{id}")))?;
        let mut changed = false;
        for (field, value) in patch.fields() {
            changed |= record.set_flag(*field, *value)?;
        }
        Ok(if changed {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Unchanged
        })
    }

    /// Push fresh snapshots to watchers of `collection` whose result set changed.
    fn notify(&mut self, collection: Collection) {
        let mut watchers = std::mem::take(&mut self.watchers);
        watchers.retain_mut(|w| {
            if w.tx.is_closed() {
                return false;
            }
            if w.collection != collection {
                return true;
            }
            let next = self.snapshot(w.collection, &w.filters);
            if next == w.last {
                return true;
            }
            w.last = next.clone();
            w.tx.send(Ok(next)).is_ok()
        });
        self.watchers = watchers;
    }

    /// Fail every live watcher on `collection` with `err`.
    fn revoke(&mut self, collection: Collection, err: &StoreError) {
        self.watchers.retain(|w| {
            if w.collection != collection {
                return true;
            }
            let _ = w.tx.send(Err(err.clone()));
            false
        });
    }
}

/// Process-local `RemoteStore` with fault injection.
///
/// Cloning shares the same underlying documents, so a test can hand one clone
/// to a session and keep another to inspect or mutate state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `kind`. Calls queue up in order.
    pub fn fail_next(&self, op: StoreOp, kind: StoreErrorKind) {
        self.lock().failures.entry(op).or_default().push_back(kind);
    }

    /// Revoke read access to `collection`: live subscriptions receive
    /// `permission-denied` and new ones fail immediately.
    pub fn deny_subscriptions(&self, collection: Collection) {
        let mut state = self.lock();
        state.denied.insert(collection);
        let err = StoreError::permission_denied(format!("read access to {collection} revoked"));
        state.revoke(collection, &err);
    }

    pub fn allow_subscriptions(&self, collection: Collection) {
        self.lock().denied.remove(&collection);
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn records(&self, collection: Collection) -> Vec<Record> {
        self.lock().records.get(&collection).cloned().unwrap_or_default()
    }

    pub fn get(&self, collection: Collection, id: Uuid) -> Option<Record> {
        self.lock()
            .records
            .get(&collection)
            .and_then(|records| records.iter().find(|r| r.id() == id).cloned())
    }

    pub fn live_subscriptions(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn create(&self, record: Record) -> StoreResult<Uuid> {
        let mut state = self.lock();
        state.enter(StoreOp::Create)?;
        record.validate()?;

        let collection = record.collection();
        let id = record.id();
        if state.contains(collection, id) {
            return Err(StoreError::already_exists(format!("{collection}/{id}")));
        }
        state.records.entry(collection).or_default().push(record);
        state.notify(collection);
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: Uuid, patch: Patch) -> StoreResult<UpdateOutcome> {
        let mut state = self.lock();
        state.enter(StoreOp::Update)?;
        patch.check()?;

        let outcome = state.apply(collection, id, &patch)?;
        if outcome.is_applied() {
            state.notify(collection);
        }
        Ok(outcome)
    }

    async fn update_many(&self, updates: Vec<Update>) -> StoreResult<Vec<UpdateOutcome>> {
        let mut state = self.lock();
        state.enter(StoreOp::Update)?;

        for update in &updates {
            update.patch.check()?;
            if !state.contains(update.collection, update.id) {
                return Err(StoreError::not_found(format!("{}/{}", update.collection, update.id)));
            }
        }

        // Validate every flag against a scratch copy first so a bad field in a
        // later update cannot leave earlier ones applied.
        for update in &updates {
            if let Some(record) = state.find_mut(update.collection, update.id) {
                let mut scratch = record.clone();
                for (field, value) in update.patch.fields() {
                    scratch.set_flag(*field, *value)?;
                }
            }
        }

        let mut outcomes = Vec::with_capacity(updates.len());
        let mut touched = HashSet::new();
        for update in &updates {
            let outcome = state.apply(update.collection, update.id, &update.patch)?;
            if outcome.is_applied() {
                touched.insert(update.collection);
            }
            outcomes.push(outcome);
        }
        for collection in touched {
            state.notify(collection);
        }
        Ok(outcomes)
    }

    async fn query(&self, collection: Collection, filters: &[Filter]) -> StoreResult<Snapshot> {
        let mut state = self.lock();
        state.enter(StoreOp::Query)?;
        Ok(state.snapshot(collection, filters))
    }

    fn subscribe(&self, collection: Collection, filters: Vec<Filter>) -> ChangeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let admitted = state.enter(StoreOp::Subscribe).and_then(|()| {
            if state.denied.contains(&collection) {
                Err(StoreError::permission_denied(format!("read access to {collection} denied")))
            } else {
                Ok(())
            }
        });
        if let Err(err) = admitted {
            let _ = tx.send(Err(err));
            return rx;
        }

        let initial = state.snapshot(collection, &filters);
        if tx.send(Ok(initial.clone())).is_ok() {
            state.watchers.push(Watcher {
                collection,
                filters,
                tx,
                last: initial,
            });
        }
        rx
    }
}
