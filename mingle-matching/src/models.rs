use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use mingle_shared::{StoreError, StoreResult};

use crate::schema::{likes, messages, profiles};
use crate::store::{Collection, Field, FieldValue};

// --- Profile ---

#[derive(
    Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Insertable, Serialize, Deserialize, Validate,
)]
#[diesel(table_name = profiles)]
pub struct Profile {
    pub id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub event_id: String,
    #[validate(length(min = 1, max = 64))]
    pub session_id: String,
    #[validate(length(min = 1, max = 40))]
    pub first_name: String,
    #[validate(range(min = 18, max = 120))]
    pub age: i32,
    #[validate(length(max = 32))]
    pub gender_identity: String,
    #[validate(length(max = 32))]
    pub interested_in: String,
    pub is_visible: bool,
}

// --- Like ---

/// One-directional interest from `liker_session_id` toward `liked_session_id`.
///
/// `is_mutual` and both notified flags only ever move from `false` to `true`.
#[derive(
    Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Insertable, Serialize, Deserialize, Validate,
)]
#[diesel(table_name = likes)]
#[validate(schema(function = "validate_like_pair"))]
pub struct Like {
    pub id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub event_id: String,
    #[validate(length(min = 1, max = 64))]
    pub liker_session_id: String,
    #[validate(length(min = 1, max = 64))]
    pub liked_session_id: String,
    pub from_profile_id: Uuid,
    pub to_profile_id: Uuid,
    pub is_mutual: bool,
    pub liker_notified_of_match: bool,
    pub liked_notified_of_match: bool,
    pub created_at: DateTime<Utc>,
}

fn validate_like_pair(like: &Like) -> Result<(), ValidationError> {
    if like.liker_session_id == like.liked_session_id || like.from_profile_id == like.to_profile_id {
        return Err(ValidationError::new("self_like"));
    }
    Ok(())
}

impl Like {
    pub fn new(liker: &Profile, liked: &Profile) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: liker.event_id.clone(),
            liker_session_id: liker.session_id.clone(),
            liked_session_id: liked.session_id.clone(),
            from_profile_id: liker.id,
            to_profile_id: liked.id,
            is_mutual: false,
            liker_notified_of_match: false,
            liked_notified_of_match: false,
            created_at: Utc::now(),
        }
    }

    pub fn pair_id(&self) -> String {
        match_pair_id(&self.event_id, &self.liker_session_id, &self.liked_session_id)
    }

    /// Whether the given participant of this pair has already been told about the match.
    pub fn notified(&self, session_id: &str) -> bool {
        if session_id == self.liker_session_id {
            self.liker_notified_of_match
        } else if session_id == self.liked_session_id {
            self.liked_notified_of_match
        } else {
            false
        }
    }
}

/// Content key for an unordered pair of sessions within an event.
pub fn match_pair_id(event_id: &str, a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{event_id}:{lo}:{hi}")
}

// --- Message ---

#[derive(
    Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Insertable, Serialize, Deserialize, Validate,
)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub event_id: String,
    pub from_profile_id: Uuid,
    pub to_profile_id: Uuid,
    #[validate(length(min = 1, max = 2000))]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

// --- Record ---

/// A document as it crosses the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Profile(Profile),
    Like(Like),
    Message(Message),
}

impl Record {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Profile(_) => Collection::Profiles,
            Self::Like(_) => Collection::Likes,
            Self::Message(_) => Collection::Messages,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Profile(p) => p.id,
            Self::Like(l) => l.id,
            Self::Message(m) => m.id,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Self::Profile(p) => p.validate(),
            Self::Like(l) => l.validate(),
            Self::Message(m) => m.validate(),
        }
    }

    /// Read a filterable field. `None` when the field does not exist on this kind.
    pub fn get(&self, field: Field) -> Option<FieldValue> {
        let value = match (self, field) {
            (_, Field::Id) => FieldValue::Uuid(self.id()),

            (Self::Profile(p), Field::EventId) => FieldValue::Text(p.event_id.clone()),
            (Self::Profile(p), Field::SessionId) => FieldValue::Text(p.session_id.clone()),
            (Self::Profile(p), Field::IsVisible) => FieldValue::Bool(p.is_visible),

            (Self::Like(l), Field::EventId) => FieldValue::Text(l.event_id.clone()),
            (Self::Like(l), Field::LikerSessionId) => FieldValue::Text(l.liker_session_id.clone()),
            (Self::Like(l), Field::LikedSessionId) => FieldValue::Text(l.liked_session_id.clone()),
            (Self::Like(l), Field::FromProfileId) => FieldValue::Uuid(l.from_profile_id),
            (Self::Like(l), Field::ToProfileId) => FieldValue::Uuid(l.to_profile_id),
            (Self::Like(l), Field::IsMutual) => FieldValue::Bool(l.is_mutual),
            (Self::Like(l), Field::LikerNotifiedOfMatch) => FieldValue::Bool(l.liker_notified_of_match),
            (Self::Like(l), Field::LikedNotifiedOfMatch) => FieldValue::Bool(l.liked_notified_of_match),

            (Self::Message(m), Field::EventId) => FieldValue::Text(m.event_id.clone()),
            (Self::Message(m), Field::FromProfileId) => FieldValue::Uuid(m.from_profile_id),
            (Self::Message(m), Field::ToProfileId) => FieldValue::Uuid(m.to_profile_id),
            (Self::Message(m), Field::Seen) => FieldValue::Bool(m.seen),

            _ => return None,
        };
        Some(value)
    }

    /// Write a boolean flag. Returns whether the stored value changed.
    pub fn set_flag(&mut self, field: Field, value: bool) -> StoreResult<bool> {
        let slot = match (self, field) {
            (Self::Profile(p), Field::IsVisible) => &mut p.is_visible,
            (Self::Like(l), Field::IsMutual) => &mut l.is_mutual,
            (Self::Like(l), Field::LikerNotifiedOfMatch) => &mut l.liker_notified_of_match,
            (Self::Like(l), Field::LikedNotifiedOfMatch) => &mut l.liked_notified_of_match,
            (Self::Message(m), Field::Seen) => &mut m.seen,
            (record, field) => {
                return Err(StoreError::invalid(format!(
                    "{} has no flag {}",
                    record.collection().as_str(),
                    field.as_str()
                )))
            }
        };
        if *slot == value {
            return Ok(false);
        }
        *slot = value;
        Ok(true)
    }

    pub fn as_like(&self) -> Option<&Like> {
        match self {
            Self::Like(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_profile(&self) -> Option<&Profile> {
        match self {
            Self::Profile(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::profile;

    #[test]
    fn pair_id_is_order_independent() {
        assert_eq!(match_pair_id("ev", "b", "a"), "ev:a:b");
        assert_eq!(match_pair_id("ev", "a", "b"), match_pair_id("ev", "b", "a"));
    }

    #[test]
    fn self_like_fails_validation() {
        let ana = profile("ev", "s-ana", "Ana", true);
        let like = Like::new(&ana, &ana);
        assert!(Record::Like(like).validate().is_err());
    }

    #[test]
    fn underage_profile_fails_validation() {
        let mut kid = profile("ev", "s-kid", "Kid", true);
        kid.age = 16;
        let errors = Record::Profile(kid).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("age"));
    }

    #[test]
    fn record_json_is_tagged() {
        let ana = profile("ev", "s-ana", "Ana", true);
        let json = serde_json::to_value(Record::Profile(ana)).unwrap();
        assert_eq!(json["kind"], "profile");
        assert_eq!(json["first_name"], "Ana");
    }

    #[test]
    fn flags_reject_unknown_fields() {
        let ana = profile("ev", "s-ana", "Ana", true);
        let mut record = Record::Profile(ana);
        assert!(record.set_flag(Field::IsMutual, true).is_err());
        assert_eq!(record.set_flag(Field::IsVisible, true), Ok(false));
        assert_eq!(record.set_flag(Field::IsVisible, false), Ok(true));
        assert_eq!(record.get(Field::IsVisible), Some(FieldValue::Bool(false)));
    }

    #[test]
    fn notified_reads_the_right_direction() {
        let ana = profile("ev", "s-ana", "Ana", true);
        let ben = profile("ev", "s-ben", "Ben", true);
        let mut like = Like::new(&ana, &ben);
        like.liked_notified_of_match = true;
        assert!(!like.notified("s-ana"));
        assert!(like.notified("s-ben"));
        assert!(!like.notified("s-cat"));
    }
}
