//! Store wrapper whose operations can be switched to fail.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use activity_notify::db::DbError;
use activity_notify::{
    ActivityEvent, ActivityFilter, ActivityPatch, ActivityRecord, ActivityStore, SortOrder,
    SqliteActivityStore, StoreError,
};

pub struct FlakyStore {
    inner: SqliteActivityStore,
    fail_appends: AtomicBool,
    fail_queries: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteActivityStore::open_in_memory().expect("in-memory store"),
            fail_appends: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
        }
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> StoreError {
        StoreError::Persistence(DbError::Sqlite(rusqlite::Error::InvalidQuery))
    }
}

#[async_trait]
impl ActivityStore for FlakyStore {
    async fn append(&self, event: &ActivityEvent) -> Result<ActivityRecord, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.append(event).await
    }

    async fn query(
        &self,
        filter: &ActivityFilter,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.query(filter, sort, limit).await
    }

    async fn update(&self, ids: &[String], patch: ActivityPatch) -> Result<usize, StoreError> {
        self.inner.update(ids, patch).await
    }
}
