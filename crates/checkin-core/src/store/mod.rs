//! Remote document store seam.
//!
//! The hosted document database is reached through the `DocumentStore`
//! trait. `HttpStore` talks to its REST endpoints; `MemoryStore` is an
//! in-process implementation with a real-time push feed, used for tests
//! and dry runs.
//!
//! Attendance entries change through a per-event change feed. Stores that
//! can push changes expose a broadcast channel; the rest are polled with
//! `changes_since`.

pub mod client;
pub mod error;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{AttendanceEntry, Event, PersonRecord, User};

pub use client::HttpStore;
pub use error::StoreError;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change to an attendance entry, as delivered by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub kind: ChangeKind,
    pub event_id: String,
    pub entry_id: String,
    /// Present for Added/Modified.
    #[serde(default)]
    pub entry: Option<AttendanceEntry>,
    pub at: DateTime<Utc>,
}

impl Change {
    pub fn added(entry: AttendanceEntry) -> Self {
        Self {
            kind: ChangeKind::Added,
            event_id: entry.event_id.clone(),
            entry_id: entry.id.clone(),
            entry: Some(entry),
            at: Utc::now(),
        }
    }

    pub fn modified(entry: AttendanceEntry) -> Self {
        Self {
            kind: ChangeKind::Modified,
            ..Self::added(entry)
        }
    }

    pub fn removed(event_id: &str, entry_id: &str) -> Self {
        Self {
            kind: ChangeKind::Removed,
            event_id: event_id.to_string(),
            entry_id: entry_id.to_string(),
            entry: None,
            at: Utc::now(),
        }
    }
}

/// Changes for one event, delivered together after debouncing.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub event_id: String,
    pub changes: Vec<Change>,
    /// The listener lost changes; the receiver should reload the event's entries.
    pub resync: bool,
}

/// Absolute counter values for an event and its groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub current_count: u32,
    #[serde(default)]
    pub groups: BTreeMap<String, u32>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_events(&self) -> StoreResult<Vec<Event>>;

    async fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>>;

    async fn put_event(&self, event: &Event) -> StoreResult<()>;

    async fn delete_event(&self, event_id: &str) -> StoreResult<()>;

    async fn list_entries(&self, event_id: &str) -> StoreResult<Vec<AttendanceEntry>>;

    /// Create or replace an entry. Idempotent for a given entry id.
    async fn put_entry(&self, entry: &AttendanceEntry) -> StoreResult<()>;

    async fn delete_entry(&self, event_id: &str, entry_id: &str) -> StoreResult<()>;

    /// Atomically increment the event counter and, if given, a group counter.
    async fn adjust_counts(&self, event_id: &str, group: Option<&str>, delta: i64)
        -> StoreResult<()>;

    /// Overwrite the event's counters.
    async fn set_counts(&self, event_id: &str, counts: &CounterSnapshot) -> StoreResult<()>;

    /// Entry changes stamped at or after `since` (all changes when `None`),
    /// oldest first. Inclusive, so a change sharing the last seen instant is
    /// not skipped.
    async fn changes_since(
        &self,
        event_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Change>>;

    async fn find_person(&self, id_number: &str) -> StoreResult<Option<PersonRecord>>;

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>>;

    async fn put_user(&self, user: &User) -> StoreResult<()>;

    /// Real-time push feed, for stores that support it.
    fn push_channel(&self) -> Option<broadcast::Receiver<Change>> {
        None
    }
}
