//! The signaling channel: the only coordination path between two parties.
//!
//! [`SignalingChannel`] is the contract the call session drives.
//! [`SqliteChannel`] implements it over a [`Database`] plus an in-process
//! [`WatchRegistry`](crate::watch) so every party sharing the handle sees
//! every committed change.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use parley_shared::{
    CallId, CallRecord, CallUpdate, CandidateBlob, CandidateItem, CandidateSide, ConversationId,
    PartyId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::watch::{CallFilter, SharedRegistry, Subscription, WatchGuard, WatchRegistry};

/// Persistence and change-feed operations for call records and their two
/// candidate sequences.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Create a ringing record created by `created_by`.
    async fn create_call(
        &self,
        conversation: &ConversationId,
        created_by: &PartyId,
    ) -> Result<CallRecord>;

    /// Fetch a record. `Ok(None)` if it does not exist.
    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>>;

    /// Merge a partial update at field granularity and return the result.
    async fn update_call(&self, id: &CallId, update: CallUpdate) -> Result<CallRecord>;

    /// Live feed of records matching `filter`: current matches first, then
    /// every change that leaves a record matching.
    async fn watch_calls(&self, filter: CallFilter) -> Result<Subscription<CallRecord>>;

    /// Live feed of one record: its current state, then every change.
    async fn watch_call(&self, id: &CallId) -> Result<Subscription<CallRecord>>;

    /// Append to one candidate sequence and return the item's `seq`.
    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: CandidateBlob,
    ) -> Result<u64>;

    /// Live feed of one candidate sequence: existing items, then every
    /// append, in append order.
    async fn watch_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<CandidateItem>>;
}

/// [`SignalingChannel`] backed by SQLite.
///
/// Writes and their notifications happen under the connection lock, and a
/// new watch snapshots and registers under the same lock, so no change can
/// fall between a snapshot and its live feed.
pub struct SqliteChannel {
    db: Mutex<Database>,
    registry: SharedRegistry,
}

impl SqliteChannel {
    pub fn new(db: Database) -> Self {
        Self {
            db: Mutex::new(db),
            registry: Arc::new(Mutex::new(WatchRegistry::default())),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Number of live subscriptions of any kind.
    pub fn watcher_count(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Run `f` against the database under the connection lock.
    pub fn with_database<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db()?;
        f(&db)
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn registry(&self) -> Result<MutexGuard<'_, WatchRegistry>> {
        self.registry.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl SignalingChannel for SqliteChannel {
    async fn create_call(
        &self,
        conversation: &ConversationId,
        created_by: &PartyId,
    ) -> Result<CallRecord> {
        let db = self.db()?;
        let draft = CallRecord::ringing(conversation.clone(), created_by.clone(), Utc::now());
        db.insert_call(&draft)?;
        // Re-read so every party sees the stored timestamp precision.
        let record = db.get_call(&draft.id)?;

        debug!(call = %record.id.short(), by = %created_by.short(), "call record created");
        self.registry()?.publish_call(&record);
        Ok(record)
    }

    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>> {
        match self.db()?.get_call(id) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_call(&self, id: &CallId, update: CallUpdate) -> Result<CallRecord> {
        let db = self.db()?;
        let record = db.update_call(id, &update, Utc::now())?;

        debug!(call = %id.short(), status = %record.status, "call record updated");
        self.registry()?.publish_call(&record);
        Ok(record)
    }

    async fn watch_calls(&self, filter: CallFilter) -> Result<Subscription<CallRecord>> {
        let db = self.db()?;
        let current = db.list_calls(&filter.conversation, &filter.statuses)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for record in current.into_iter().filter(|r| filter.matches(r)) {
            let _ = tx.send(record);
        }

        let id = self.registry()?.add_filter(filter, tx);
        Ok(Subscription::new(rx, WatchGuard::new(&self.registry, id)))
    }

    async fn watch_call(&self, id: &CallId) -> Result<Subscription<CallRecord>> {
        let db = self.db()?;
        let current = db.get_call(id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current);

        let watch = self.registry()?.add_record(*id, tx);
        Ok(Subscription::new(rx, WatchGuard::new(&self.registry, watch)))
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: CandidateBlob,
    ) -> Result<u64> {
        let db = self.db()?;
        let seq = db.append_candidate(id, side, &candidate, Utc::now())?;

        let item = CandidateItem { seq, candidate };
        self.registry()?.publish_candidate(id, side, &item);
        Ok(seq)
    }

    async fn watch_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<CandidateItem>> {
        let db = self.db()?;
        let current = db.list_candidates(id, side)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for item in current {
            let _ = tx.send(item);
        }

        let watch = self.registry()?.add_candidates(*id, side, tx);
        Ok(Subscription::new(rx, WatchGuard::new(&self.registry, watch)))
    }
}
