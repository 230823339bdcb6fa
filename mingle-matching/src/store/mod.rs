//! Remote document store: the seam between matching logic and persistence.
//!
//! Every mutation the matching logic performs is a conditional merge over
//! boolean flags. `Patch` only carries flags, and monotonic flags can only be
//! raised, so two devices racing on the same record converge without a lock.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use mingle_shared::{StoreError, StoreResult};

use crate::models::{Like, Message, Profile, Record};

pub use memory::{InMemoryStore, StoreOp};
pub use postgres::PgStore;

// ─── Addressing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Profiles,
    Likes,
    Messages,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Likes => "likes",
            Self::Messages => "messages",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    EventId,
    SessionId,
    IsVisible,
    LikerSessionId,
    LikedSessionId,
    FromProfileId,
    ToProfileId,
    IsMutual,
    LikerNotifiedOfMatch,
    LikedNotifiedOfMatch,
    Seen,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::EventId => "event_id",
            Self::SessionId => "session_id",
            Self::IsVisible => "is_visible",
            Self::LikerSessionId => "liker_session_id",
            Self::LikedSessionId => "liked_session_id",
            Self::FromProfileId => "from_profile_id",
            Self::ToProfileId => "to_profile_id",
            Self::IsMutual => "is_mutual",
            Self::LikerNotifiedOfMatch => "liker_notified_of_match",
            Self::LikedNotifiedOfMatch => "liked_notified_of_match",
            Self::Seen => "seen",
        }
    }

    /// Flags that may only move from `false` to `true`.
    pub fn is_monotonic(&self) -> bool {
        matches!(
            self,
            Self::IsMutual | Self::LikerNotifiedOfMatch | Self::LikedNotifiedOfMatch | Self::Seen
        )
    }

    pub fn is_flag(&self) -> bool {
        self.is_monotonic() || matches!(self, Self::IsVisible)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Text(String),
    Uuid(Uuid),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Equality predicate. Queries and subscriptions take a conjunction of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: Field,
    pub value: FieldValue,
}

impl Filter {
    pub fn eq(field: Field, value: impl Into<FieldValue>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.get(self.field).as_ref() == Some(&self.value)
    }
}

pub fn matches_all(filters: &[Filter], record: &Record) -> bool {
    filters.iter().all(|f| f.matches(record))
}

// ─── Conditional merge ──────────────────────────────────────────────────────

/// Set-if-different over boolean flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    fields: Vec<(Field, bool)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(field: Field) -> Self {
        Self::new().set(field, true)
    }

    pub fn set(mut self, field: Field, value: bool) -> Self {
        self.fields.push((field, value));
        self
    }

    pub fn fields(&self) -> &[(Field, bool)] {
        &self.fields
    }

    /// Rejects non-flag fields and any attempt to lower a monotonic flag.
    pub fn check(&self) -> StoreResult<()> {
        for (field, value) in &self.fields {
            if !field.is_flag() {
                return Err(StoreError::invalid(format!("{} is not patchable", field.as_str())));
            }
            if field.is_monotonic() && !value {
                return Err(StoreError::invalid(format!(
                    "{} can only be raised",
                    field.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub collection: Collection,
    pub id: Uuid,
    pub patch: Patch,
}

impl Update {
    pub fn raise(collection: Collection, id: Uuid, field: Field) -> Self {
        Self {
            collection,
            id,
            patch: Patch::raise(field),
        }
    }
}

/// Result of a conditional merge. `Unchanged` means every field already held
/// the requested value, which callers treat as a successful no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Unchanged,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ─── Snapshots ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: Vec<Record>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.records.iter().filter_map(Record::as_profile)
    }

    pub fn likes(&self) -> impl Iterator<Item = &Like> {
        self.records.iter().filter_map(Record::as_like)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.records.iter().filter_map(Record::as_message)
    }
}

/// Stream of snapshots for one subscription. The first item is the initial
/// result set; later items arrive only when the result set changes. An `Err`
/// item is terminal. Dropping the receiver unsubscribes.
pub type ChangeFeed = mpsc::UnboundedReceiver<StoreResult<Snapshot>>;

// ─── RemoteStore ────────────────────────────────────────────────────────────

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Insert a validated record. The store does not deduplicate by content;
    /// callers check for existence first. Re-sending the same id yields
    /// `AlreadyExists`.
    async fn create(&self, record: Record) -> StoreResult<Uuid>;

    async fn update(&self, collection: Collection, id: Uuid, patch: Patch) -> StoreResult<UpdateOutcome>;

    /// Apply several conditional merges atomically: either every target exists
    /// and all are applied, or none are.
    async fn update_many(&self, updates: Vec<Update>) -> StoreResult<Vec<UpdateOutcome>>;

    async fn query(&self, collection: Collection, filters: &[Filter]) -> StoreResult<Snapshot>;

    fn subscribe(&self, collection: Collection, filters: Vec<Filter>) -> ChangeFeed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::profile;

    #[test]
    fn patch_rejects_lowering_monotonic_flags() {
        assert!(Patch::raise(Field::IsMutual).check().is_ok());
        assert!(Patch::new().set(Field::IsVisible, false).check().is_ok());

        let err = Patch::new().set(Field::IsMutual, false).check().unwrap_err();
        assert_eq!(err.kind, mingle_shared::StoreErrorKind::InvalidArgument);

        assert!(Patch::raise(Field::EventId).check().is_err());
    }

    #[test]
    fn filters_are_conjunctive() {
        let record = Record::Profile(profile("ev", "s-ana", "Ana", true));
        let filters = vec![
            Filter::eq(Field::EventId, "ev"),
            Filter::eq(Field::IsVisible, true),
        ];
        assert!(matches_all(&filters, &record));

        let filters = vec![
            Filter::eq(Field::EventId, "ev"),
            Filter::eq(Field::SessionId, "s-ben"),
        ];
        assert!(!matches_all(&filters, &record));
    }

    #[test]
    fn missing_field_never_matches() {
        let record = Record::Profile(profile("ev", "s-ana", "Ana", true));
        assert!(!Filter::eq(Field::IsMutual, false).matches(&record));
    }
}
