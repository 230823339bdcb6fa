use std::sync::Arc;

use metrics::counter;

use mingle_shared::types::event::payloads::MatchObserved;
use mingle_shared::{ErrorClass, StoreError};

use crate::models::Like;
use crate::retry::RetryPolicy;
use crate::store::{Collection, Field, Filter, RemoteStore, Update};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The liked session has not liked back yet.
    NoReciprocal,
    /// This execution raised `is_mutual` on at least one side.
    Matched(MatchObserved),
    /// Both sides were already mutual, or another writer won the race.
    AlreadyMatched(MatchObserved),
}

impl Detection {
    pub fn observed(&self) -> Option<&MatchObserved> {
        match self {
            Self::NoReciprocal => None,
            Self::Matched(m) | Self::AlreadyMatched(m) => Some(m),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("like {0} points at its own liker")]
    SelfLike(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DetectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SelfLike(_) => ErrorClass::DataIntegrity,
            Self::Store(e) => e.class(),
        }
    }
}

/// The match event for the unordered pair behind `like`.
pub fn observed_match(like: &Like) -> MatchObserved {
    let (user_a, user_b) = if like.liker_session_id <= like.liked_session_id {
        (&like.liker_session_id, &like.liked_session_id)
    } else {
        (&like.liked_session_id, &like.liker_session_id)
    };
    MatchObserved {
        pair_id: like.pair_id(),
        event_id: like.event_id.clone(),
        user_a: user_a.clone(),
        user_b: user_b.clone(),
    }
}

/// Flips both sides of a reciprocated like to mutual.
///
/// Only reads the authoritative store. Writes are conditional raises issued in
/// one atomic batch, so two devices detecting the same pair at once converge
/// and a crash can never leave the pair half-mutual.
pub struct MatchDetector {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl MatchDetector {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn observe(&self, like: &Like) -> Result<Detection, DetectError> {
        if like.liker_session_id == like.liked_session_id {
            return Err(DetectError::SelfLike(like.id));
        }

        let store = &self.store;
        let filters = &[
            Filter::eq(Field::EventId, like.event_id.as_str()),
            Filter::eq(Field::LikerSessionId, like.liked_session_id.as_str()),
            Filter::eq(Field::LikedSessionId, like.liker_session_id.as_str()),
        ];
        let reciprocal = self
            .retry
            .run("detector.query_reciprocal", move || store.query(Collection::Likes, filters))
            .await?;

        let reciprocals: Vec<&Like> = reciprocal.likes().collect();
        if reciprocals.is_empty() {
            tracing::debug!(like_id = %like.id, "no reciprocal like yet");
            return Ok(Detection::NoReciprocal);
        }

        let observed = observed_match(like);
        let already = reciprocals.iter().any(|l| l.is_mutual);

        if already && like.is_mutual {
            return Ok(Detection::AlreadyMatched(observed));
        }

        // When the other side is already mutual only this side can be stale,
        // so the reciprocal is left untouched.
        let mut updates = vec![Update::raise(Collection::Likes, like.id, Field::IsMutual)];
        if !already {
            updates.extend(
                reciprocals
                    .iter()
                    .map(|l| Update::raise(Collection::Likes, l.id, Field::IsMutual)),
            );
        }

        let outcomes = self
            .retry
            .run("detector.raise_mutual", move || store.update_many(updates.clone()))
            .await?;
        let applied = outcomes.iter().any(|o| o.is_applied());

        if already || !applied {
            if applied {
                tracing::info!(pair_id = %observed.pair_id, "healed half-mutual pair");
            }
            return Ok(Detection::AlreadyMatched(observed));
        }

        counter!("matches_detected_total").increment(1);
        tracing::info!(
            pair_id = %observed.pair_id,
            user_a = %observed.user_a,
            user_b = %observed.user_b,
            "mutual match detected"
        );
        Ok(Detection::Matched(observed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::store::{InMemoryStore, Patch, RemoteStore, StoreOp};
    use crate::testing::{profile, quick_retry};
    use mingle_shared::StoreErrorKind;

    struct Pair {
        store: InMemoryStore,
        detector: MatchDetector,
        ab: Like,
        ba: Like,
    }

    async fn pair(with_reciprocal: bool) -> Pair {
        let store = InMemoryStore::new();
        let ana = profile("ev", "s-ana", "Ana", true);
        let ben = profile("ev", "s-ben", "Ben", true);
        let ab = Like::new(&ana, &ben);
        let ba = Like::new(&ben, &ana);
        store.create(Record::Like(ab.clone())).await.unwrap();
        if with_reciprocal {
            store.create(Record::Like(ba.clone())).await.unwrap();
        }
        let detector = MatchDetector::new(Arc::new(store.clone()), quick_retry());
        Pair { store, detector, ab, ba }
    }

    fn mutual(store: &InMemoryStore, like: &Like) -> bool {
        store
            .get(Collection::Likes, like.id)
            .and_then(|r| r.as_like().map(|l| l.is_mutual))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn first_like_has_no_reciprocal() {
        let p = pair(false).await;
        assert_eq!(p.detector.observe(&p.ab).await.unwrap(), Detection::NoReciprocal);
        assert!(!mutual(&p.store, &p.ab));
        assert_eq!(p.store.call_count(StoreOp::Update), 0);
    }

    #[tokio::test]
    async fn reciprocal_likes_become_mutual() {
        let p = pair(true).await;
        let detection = p.detector.observe(&p.ba).await.unwrap();

        let observed = detection.observed().unwrap();
        assert!(matches!(detection, Detection::Matched(_)));
        assert_eq!(observed.pair_id, "ev:s-ana:s-ben");
        assert_eq!((observed.user_a.as_str(), observed.user_b.as_str()), ("s-ana", "s-ben"));
        assert!(mutual(&p.store, &p.ab));
        assert!(mutual(&p.store, &p.ba));
    }

    #[tokio::test]
    async fn detection_is_idempotent() {
        let p = pair(true).await;
        p.detector.observe(&p.ab).await.unwrap();
        let before = p.store.records(Collection::Likes);

        // Second run with the stale (non-mutual) copy the first caller held.
        let again = p.detector.observe(&p.ab).await.unwrap();
        assert!(matches!(again, Detection::AlreadyMatched(_)));
        assert_eq!(p.store.records(Collection::Likes), before);
    }

    #[tokio::test]
    async fn concurrent_detections_converge() {
        let p = pair(true).await;
        let (a, b) = tokio::join!(p.detector.observe(&p.ab), p.detector.observe(&p.ba));
        let results = [a.unwrap(), b.unwrap()];

        let matched = results
            .iter()
            .filter(|d| matches!(d, Detection::Matched(_)))
            .count();
        assert_eq!(matched, 1);
        assert!(mutual(&p.store, &p.ab));
        assert!(mutual(&p.store, &p.ba));
    }

    #[tokio::test]
    async fn half_mutual_pair_is_healed() {
        let p = pair(true).await;
        p.store
            .update(Collection::Likes, p.ba.id, Patch::raise(Field::IsMutual))
            .await
            .unwrap();

        let detection = p.detector.observe(&p.ab).await.unwrap();
        assert!(matches!(detection, Detection::AlreadyMatched(_)));
        assert!(mutual(&p.store, &p.ab));
    }

    #[tokio::test]
    async fn transient_query_failures_are_retried() {
        let p = pair(true).await;
        p.store.fail_next(StoreOp::Query, StoreErrorKind::Unavailable);
        assert!(matches!(
            p.detector.observe(&p.ab).await.unwrap(),
            Detection::Matched(_)
        ));
        assert_eq!(p.store.call_count(StoreOp::Query), 2);
    }

    #[tokio::test]
    async fn permission_failures_surface_without_writes() {
        let p = pair(true).await;
        p.store.fail_next(StoreOp::Query, StoreErrorKind::PermissionDenied);
        let err = p.detector.observe(&p.ab).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permission);
        assert!(!mutual(&p.store, &p.ab));
        assert!(!mutual(&p.store, &p.ba));
    }
}
