use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use mingle_shared::{StoreError, StoreResult};

use crate::models::Profile;
use crate::retry::RetryPolicy;
use crate::store::{Collection, Field, Filter, RemoteStore};

/// Profile lookups used for notification content and like targets.
/// A missing profile is a `not-found` store error.
#[async_trait]
pub trait ProfileDirectory: Send + Sync + 'static {
    async fn lookup_by_session(&self, session_id: &str, event_id: &str) -> StoreResult<Profile>;
    async fn lookup_by_id(&self, profile_id: Uuid) -> StoreResult<Profile>;
}

pub struct StoreProfileDirectory {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl StoreProfileDirectory {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    async fn first(&self, filters: Vec<Filter>, what: String) -> StoreResult<Profile> {
        let store = &self.store;
        let filters = &filters;
        let snapshot = self
            .retry
            .run("profiles.lookup", move || store.query(Collection::Profiles, filters))
            .await?;
        let profile = snapshot.profiles().next().cloned();
        profile.ok_or_else(|| StoreError::not_found(what))
    }
}

#[async_trait]
impl ProfileDirectory for StoreProfileDirectory {
    async fn lookup_by_session(&self, session_id: &str, event_id: &str) -> StoreResult<Profile> {
        self.first(
            vec![
                Filter::eq(Field::EventId, event_id),
                Filter::eq(Field::SessionId, session_id),
            ],
            format!("profile for session {session_id} in event {event_id}"),
        )
        .await
    }

    async fn lookup_by_id(&self, profile_id: Uuid) -> StoreResult<Profile> {
        self.first(
            vec![Filter::eq(Field::Id, profile_id)],
            format!("profile {profile_id}"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::store::InMemoryStore;
    use crate::testing::{profile, quick_retry};
    use mingle_shared::StoreErrorKind;

    #[tokio::test]
    async fn lookups_hit_by_session_and_id() {
        let store = InMemoryStore::new();
        let ana = profile("ev", "s-ana", "Ana", true);
        store.create(Record::Profile(ana.clone())).await.unwrap();
        let directory = StoreProfileDirectory::new(Arc::new(store), quick_retry());

        assert_eq!(directory.lookup_by_session("s-ana", "ev").await.unwrap(), ana);
        assert_eq!(directory.lookup_by_id(ana.id).await.unwrap(), ana);

        let err = directory.lookup_by_session("s-ana", "other-event").await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }
}
