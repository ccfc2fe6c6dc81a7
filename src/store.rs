//! Durable, append-only activity history.
//!
//! The engine talks to persistence only through [`ActivityStore`], so a host
//! can plug in its own backend. [`SqliteActivityStore`] is the bundled one:
//! it writes every event to `activity_events` and mirrors it into the
//! `(actor_id, action)` partition on a best-effort basis.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::{format_timestamp, parse_timestamp, ActivityEvent, ActivityRecord, Actor, EventDetail};
use crate::db::{queries, Database, DbError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),
    #[error("mirror error: {0}")]
    Mirror(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    OldestFirst,
    #[default]
    NewestFirst,
}

/// Query filter. Every populated field narrows the result; `from` is
/// inclusive and `to` exclusive.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub tenant_id: Option<String>,
    pub notified: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ActivityFilter {
    pub fn actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Self::default()
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}

/// Mutable fields of a stored event. Only the notified flag may change.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityPatch {
    pub notified: Option<bool>,
}

impl ActivityPatch {
    pub fn notified() -> Self {
        Self { notified: Some(true) }
    }
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persist one event and return it with its assigned id.
    async fn append(&self, event: &ActivityEvent) -> Result<ActivityRecord, StoreError>;

    async fn query(
        &self,
        filter: &ActivityFilter,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityRecord>, StoreError>;

    /// Apply `patch` to every listed record. Returns the number updated.
    async fn update(&self, ids: &[String], patch: ActivityPatch) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteActivityStore {
    db: Arc<Database>,
}

impl SqliteActivityStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Records mirrored into the `(actor_id, action)` partition, newest first.
    pub fn partition(
        &self,
        actor_id: &str,
        action: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        queries::list_partition(&self.db, actor_id, action, limit)?
            .into_iter()
            .map(|row| row_to_record(row).map_err(StoreError::from))
            .collect()
    }

    /// Look one record up by the id `append` returned.
    pub fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError> {
        match queries::get_activity(&self.db, id)? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    fn mirror(&self, row: &queries::ActivityRow) -> Result<(), StoreError> {
        queries::insert_partition_entry(&self.db, &row.actor_id, &row.action, &row.id, &row.occurred_at)
            .map_err(|e| StoreError::Mirror(format!("{}/{}: {e}", row.actor_id, row.action)))
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn append(&self, event: &ActivityEvent) -> Result<ActivityRecord, StoreError> {
        let row = record_to_row(Uuid::new_v4().to_string(), event)?;
        queries::insert_activity(&self.db, &row)?;

        if let Err(e) = self.mirror(&row) {
            tracing::warn!("activity {} stored but not mirrored: {e}", row.id);
        }

        Ok(ActivityRecord {
            id: row.id,
            event: event.clone(),
        })
    }

    async fn query(
        &self,
        filter: &ActivityFilter,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let query = queries::ActivityQuery {
            actor_id: filter.actor_id.clone(),
            action: filter.action.clone(),
            resource: filter.resource.clone(),
            tenant_id: filter.tenant_id.clone(),
            notified: filter.notified,
            from: filter.from.as_ref().map(format_timestamp),
            to: filter.to.as_ref().map(format_timestamp),
            newest_first: sort == SortOrder::NewestFirst,
            limit,
        };
        queries::list_activities(&self.db, &query)?
            .into_iter()
            .map(|row| row_to_record(row).map_err(StoreError::from))
            .collect()
    }

    async fn update(&self, ids: &[String], patch: ActivityPatch) -> Result<usize, StoreError> {
        match patch.notified {
            Some(notified) => Ok(queries::update_activity_notified(&self.db, ids, notified)?),
            None => Ok(0),
        }
    }
}

fn record_to_row(id: String, event: &ActivityEvent) -> Result<queries::ActivityRow, DbError> {
    Ok(queries::ActivityRow {
        id,
        actor_id: event.actor.id.clone(),
        actor_name: event.actor.name.clone(),
        actor_role: event.actor.role.clone(),
        action: event.action.clone(),
        resource: event.resource.clone(),
        resource_id: event.resource_id.clone(),
        tenant_id: event.tenant_id.clone(),
        detail_json: serde_json::to_string(&event.detail)?,
        occurred_at: format_timestamp(&event.occurred_at),
        notified: event.notified,
    })
}

fn row_to_record(row: queries::ActivityRow) -> Result<ActivityRecord, DbError> {
    let occurred_at = parse_timestamp(&row.occurred_at).ok_or_else(|| DbError::Corrupt {
        id: row.id.clone(),
        reason: format!("bad occurred_at {:?}", row.occurred_at),
    })?;
    let detail: EventDetail = serde_json::from_str(&row.detail_json)?;
    Ok(ActivityRecord {
        id: row.id,
        event: ActivityEvent {
            actor: Actor {
                id: row.actor_id,
                name: row.actor_name,
                role: row.actor_role,
            },
            action: row.action,
            resource: row.resource,
            resource_id: row.resource_id,
            tenant_id: row.tenant_id,
            detail,
            occurred_at,
            notified: row.notified,
        },
    })
}
