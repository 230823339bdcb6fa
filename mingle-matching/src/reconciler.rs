use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mingle_shared::{AppError, ErrorCode, StoreError, StoreErrorKind, StoreResult};

use crate::models::{Like, Profile, Record};
use crate::retry::RetryPolicy;
use crate::store::{Collection, Field, Filter, RemoteStore};

#[derive(Debug, thiserror::Error)]
pub enum LikeError {
    #[error("profile already liked")]
    AlreadyLiked,

    #[error("you cannot like your own profile")]
    SelfLike,

    #[error("profile is not visible")]
    Invisible,

    #[error("your profile is not loaded yet")]
    ProfileMissing,

    #[error("unknown profile {0}")]
    UnknownProfile(String),

    /// The remote create failed. The optimistic entry has been rolled back.
    #[error("something went wrong, please try again")]
    Failed {
        #[source]
        cause: StoreError,
    },
}

impl LikeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl From<LikeError> for AppError {
    fn from(err: LikeError) -> Self {
        let code = match &err {
            LikeError::AlreadyLiked => ErrorCode::AlreadyLiked,
            LikeError::SelfLike => ErrorCode::CannotLikeSelf,
            LikeError::Invisible => ErrorCode::ProfileInvisible,
            LikeError::ProfileMissing | LikeError::UnknownProfile(_) => ErrorCode::ProfileNotFound,
            LikeError::Failed { .. } => ErrorCode::LikeFailed,
        };
        AppError::new(code, err.to_string())
    }
}

/// Result of a like action that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum LikeOutcome {
    Created(Like),
    /// The ordered pair was already liked remotely. Nothing was written.
    Existing(Like),
}

impl LikeOutcome {
    pub fn like(&self) -> &Like {
        match self {
            Self::Created(like) | Self::Existing(like) => like,
        }
    }

    pub fn into_like(self) -> Like {
        match self {
            Self::Created(like) | Self::Existing(like) => like,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Default)]
struct LikedState {
    liked: HashSet<String>,
    /// Bumped whenever an authoritative snapshot replaces the set.
    generation: u64,
}

/// Local-first "liked" set for the like action.
///
/// The set is a UI cache only: nothing that decides matches or notifications
/// reads it. Authoritative snapshots replace it outright.
pub struct LikeReconciler {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    state: Mutex<LikedState>,
}

impl LikeReconciler {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LikedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Liked session ids, sorted.
    pub fn liked(&self) -> Vec<String> {
        let mut liked: Vec<String> = self.lock().liked.iter().cloned().collect();
        liked.sort();
        liked
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().liked.contains(session_id)
    }

    /// Replace the local set with the authoritative one.
    pub fn apply_snapshot<I>(&self, liked: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.lock();
        state.liked = liked.into_iter().collect();
        state.generation += 1;
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.liked.clear();
        state.generation += 1;
    }

    pub async fn like_action(&self, me: &Profile, target: &Profile) -> Result<LikeOutcome, LikeError> {
        if me.session_id == target.session_id {
            return Err(LikeError::SelfLike);
        }
        if !me.is_visible || !target.is_visible {
            return Err(LikeError::Invisible);
        }

        let generation = {
            let mut state = self.lock();
            if !state.liked.insert(target.session_id.clone()) {
                return Err(LikeError::AlreadyLiked);
            }
            state.generation
        };

        match self.persist(Like::new(me, target)).await {
            Ok(outcome) => Ok(outcome),
            Err(cause) => {
                let mut state = self.lock();
                if state.generation == generation {
                    state.liked.remove(&target.session_id);
                }
                drop(state);
                tracing::warn!(
                    target_session = %target.session_id,
                    error = %cause,
                    "like failed, optimistic entry rolled back"
                );
                Err(LikeError::Failed { cause })
            }
        }
    }

    /// Existence check, then create. The store does not deduplicate, so the
    /// check is what keeps one like per ordered pair.
    async fn persist(&self, like: Like) -> StoreResult<LikeOutcome> {
        if let Some(existing) = self.existing(&like).await? {
            tracing::debug!(like_id = %existing.id, "like already stored");
            return Ok(LikeOutcome::Existing(existing));
        }

        let store = &self.store;
        let record = Record::Like(like.clone());
        match self
            .retry
            .run("reconciler.create_like", move || store.create(record.clone()))
            .await
        {
            Ok(_) => {
                tracing::info!(like_id = %like.id, liked = %like.liked_session_id, "like created");
                Ok(LikeOutcome::Created(like))
            }
            Err(err) if err.kind == StoreErrorKind::AlreadyExists => {
                let existing = self.existing(&like).await?.unwrap_or(like);
                Ok(LikeOutcome::Existing(existing))
            }
            Err(err) => Err(err),
        }
    }

    async fn existing(&self, like: &Like) -> StoreResult<Option<Like>> {
        let store = &self.store;
        let filters = &[
            Filter::eq(Field::EventId, like.event_id.as_str()),
            Filter::eq(Field::LikerSessionId, like.liker_session_id.as_str()),
            Filter::eq(Field::LikedSessionId, like.liked_session_id.as_str()),
        ];
        let snapshot = self
            .retry
            .run("reconciler.existence_check", move || store.query(Collection::Likes, filters))
            .await?;
        let like = snapshot.likes().next().cloned();
        Ok(like)
    }
}
