use std::time::Duration;

use async_trait::async_trait;
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use tokio::sync::mpsc;
use uuid::Uuid;

use mingle_shared::clients::db::DbPool;
use mingle_shared::{StoreError, StoreResult};

use super::{ChangeFeed, Collection, Field, FieldValue, Filter, Patch, RemoteStore, Snapshot, Update, UpdateOutcome};
use crate::models::{Like, Message, Profile, Record};
use crate::schema::{likes, messages, profiles};

/// `RemoteStore` over Postgres.
///
/// Flag writes are `UPDATE ... WHERE flag <> value`, so the affected row count
/// tells applied from unchanged. Subscriptions poll and only forward result
/// sets that differ from the last one sent.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    poll_interval: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, poll_interval: Duration) -> Self {
        Self { pool, poll_interval }
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::internal(format!("blocking task failed: {e}")))?
    }
}

fn unsupported(collection: Collection, filter: &Filter) -> StoreError {
    StoreError::invalid(format!(
        "cannot filter {collection} by {} = {:?}",
        filter.field.as_str(),
        filter.value
    ))
}

// ─── Writes ─────────────────────────────────────────────────────────────────

macro_rules! raise_flag {
    ($conn:expr, $table:ident, $column:ident, $id:expr, $value:expr) => {
        diesel::update($table::table.filter($table::id.eq($id)).filter($table::$column.ne($value)))
            .set($table::$column.eq($value))
            .execute($conn)?
    };
}

fn record_exists(conn: &mut PgConnection, collection: Collection, id: Uuid) -> StoreResult<bool> {
    use diesel::dsl::exists;

    let found = match collection {
        Collection::Profiles => {
            diesel::select(exists(profiles::table.filter(profiles::id.eq(id)))).get_result::<bool>(conn)?
        }
        Collection::Likes => {
            diesel::select(exists(likes::table.filter(likes::id.eq(id)))).get_result::<bool>(conn)?
        }
        Collection::Messages => {
            diesel::select(exists(messages::table.filter(messages::id.eq(id)))).get_result::<bool>(conn)?
        }
    };
    Ok(found)
}

fn apply_patch(
    conn: &mut PgConnection,
    collection: Collection,
    id: Uuid,
    patch: &Patch,
) -> StoreResult<UpdateOutcome> {
    if !record_exists(conn, collection, id)? {
        return Err(StoreError::not_found(format!("{collection}/{id}")));
    }

    let mut changed = 0;
    for &(field, value) in patch.fields() {
        changed += match (collection, field) {
            (Collection::Profiles, Field::IsVisible) => raise_flag!(conn, profiles, is_visible, id, value),
            (Collection::Likes, Field::IsMutual) => raise_flag!(conn, likes, is_mutual, id, value),
            (Collection::Likes, Field::LikerNotifiedOfMatch) => {
                raise_flag!(conn, likes, liker_notified_of_match, id, value)
            }
            (Collection::Likes, Field::LikedNotifiedOfMatch) => {
                raise_flag!(conn, likes, liked_notified_of_match, id, value)
            }
            (Collection::Messages, Field::Seen) => raise_flag!(conn, messages, seen, id, value),
            _ => {
                return Err(StoreError::invalid(format!(
                    "{collection} has no flag {}",
                    field.as_str()
                )))
            }
        };
    }

    Ok(if changed > 0 {
        UpdateOutcome::Applied
    } else {
        UpdateOutcome::Unchanged
    })
}

// ─── Reads ──────────────────────────────────────────────────────────────────

fn load_profiles(conn: &mut PgConnection, filters: &[Filter]) -> StoreResult<Vec<Record>> {
    let mut query = profiles::table.into_boxed::<Pg>();
    for filter in filters {
        query = match (filter.field, &filter.value) {
            (Field::Id, FieldValue::Uuid(v)) => query.filter(profiles::id.eq(*v)),
            (Field::EventId, FieldValue::Text(v)) => query.filter(profiles::event_id.eq(v.clone())),
            (Field::SessionId, FieldValue::Text(v)) => query.filter(profiles::session_id.eq(v.clone())),
            (Field::IsVisible, FieldValue::Bool(v)) => query.filter(profiles::is_visible.eq(*v)),
            _ => return Err(unsupported(Collection::Profiles, filter)),
        };
    }
    let rows = query.order(profiles::first_name.asc()).load::<Profile>(conn)?;
    Ok(rows.into_iter().map(Record::Profile).collect())
}

fn load_likes(conn: &mut PgConnection, filters: &[Filter]) -> StoreResult<Vec<Record>> {
    let mut query = likes::table.into_boxed::<Pg>();
    for filter in filters {
        query = match (filter.field, &filter.value) {
            (Field::Id, FieldValue::Uuid(v)) => query.filter(likes::id.eq(*v)),
            (Field::EventId, FieldValue::Text(v)) => query.filter(likes::event_id.eq(v.clone())),
            (Field::LikerSessionId, FieldValue::Text(v)) => {
                query.filter(likes::liker_session_id.eq(v.clone()))
            }
            (Field::LikedSessionId, FieldValue::Text(v)) => {
                query.filter(likes::liked_session_id.eq(v.clone()))
            }
            (Field::FromProfileId, FieldValue::Uuid(v)) => query.filter(likes::from_profile_id.eq(*v)),
            (Field::ToProfileId, FieldValue::Uuid(v)) => query.filter(likes::to_profile_id.eq(*v)),
            (Field::IsMutual, FieldValue::Bool(v)) => query.filter(likes::is_mutual.eq(*v)),
            (Field::LikerNotifiedOfMatch, FieldValue::Bool(v)) => {
                query.filter(likes::liker_notified_of_match.eq(*v))
            }
            (Field::LikedNotifiedOfMatch, FieldValue::Bool(v)) => {
                query.filter(likes::liked_notified_of_match.eq(*v))
            }
            _ => return Err(unsupported(Collection::Likes, filter)),
        };
    }
    let rows = query.order(likes::created_at.asc()).load::<Like>(conn)?;
    Ok(rows.into_iter().map(Record::Like).collect())
}

fn load_messages(conn: &mut PgConnection, filters: &[Filter]) -> StoreResult<Vec<Record>> {
    let mut query = messages::table.into_boxed::<Pg>();
    for filter in filters {
        query = match (filter.field, &filter.value) {
            (Field::Id, FieldValue::Uuid(v)) => query.filter(messages::id.eq(*v)),
            (Field::EventId, FieldValue::Text(v)) => query.filter(messages::event_id.eq(v.clone())),
            (Field::FromProfileId, FieldValue::Uuid(v)) => query.filter(messages::from_profile_id.eq(*v)),
            (Field::ToProfileId, FieldValue::Uuid(v)) => query.filter(messages::to_profile_id.eq(*v)),
            (Field::Seen, FieldValue::Bool(v)) => query.filter(messages::seen.eq(*v)),
            _ => return Err(unsupported(Collection::Messages, filter)),
        };
    }
    let rows = query.order(messages::created_at.asc()).load::<Message>(conn)?;
    Ok(rows.into_iter().map(Record::Message).collect())
}

fn load(conn: &mut PgConnection, collection: Collection, filters: &[Filter]) -> StoreResult<Snapshot> {
    let records = match collection {
        Collection::Profiles => load_profiles(conn, filters)?,
        Collection::Likes => load_likes(conn, filters)?,
        Collection::Messages => load_messages(conn, filters)?,
    };
    Ok(Snapshot::new(records))
}

// ─── RemoteStore ────────────────────────────────────────────────────────────

#[async_trait]
impl RemoteStore for PgStore {
    async fn create(&self, record: Record) -> StoreResult<Uuid> {
        record.validate()?;
        self.blocking(move |conn| {
            let id = record.id();
            match &record {
                Record::Profile(p) => diesel::insert_into(profiles::table).values(p).execute(conn)?,
                Record::Like(l) => diesel::insert_into(likes::table).values(l).execute(conn)?,
                Record::Message(m) => diesel::insert_into(messages::table).values(m).execute(conn)?,
            };
            Ok(id)
        })
        .await
    }

    async fn update(&self, collection: Collection, id: Uuid, patch: Patch) -> StoreResult<UpdateOutcome> {
        patch.check()?;
        self.blocking(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| apply_patch(conn, collection, id, &patch))
        })
        .await
    }

    async fn update_many(&self, updates: Vec<Update>) -> StoreResult<Vec<UpdateOutcome>> {
        for update in &updates {
            update.patch.check()?;
        }
        self.blocking(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                updates
                    .iter()
                    .map(|u| apply_patch(conn, u.collection, u.id, &u.patch))
                    .collect()
            })
        })
        .await
    }

    async fn query(&self, collection: Collection, filters: &[Filter]) -> StoreResult<Snapshot> {
        let filters = filters.to_vec();
        self.blocking(move |conn| load(conn, collection, &filters)).await
    }

    fn subscribe(&self, collection: Collection, filters: Vec<Filter>) -> ChangeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();

        tokio::spawn(async move {
            let mut last: Option<Snapshot> = None;
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                match store.query(collection, &filters).await {
                    Ok(snapshot) => {
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        last = Some(snapshot.clone());
                        if tx.send(Ok(snapshot)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            collection = %collection,
                            error = %err,
                            "subscription poll failed"
                        );
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }

            tracing::debug!(collection = %collection, "subscription poller stopped");
        });

        rx
    }
}
