//! Attendance synchronization.
//!
//! - `attendance`: per-event caches merging optimistic writes with pushed changes
//! - `listener`: background task delivering debounced change batches
//! - writer helpers that push local check-ins and removals to the store
//!
//! Background tasks report back to the app through a `SyncMessage` channel.

pub mod attendance;
pub mod listener;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{AttendanceEntry, Event};
use crate::store::{ChangeBatch, DocumentStore, StoreResult};

pub use attendance::{AttendanceCache, AttendanceIndex, MergeOutcome, PendingOp, SyncError};
pub use listener::{spawn_listener, ListenerConfig};

/// Attempts for each store write before giving up.
const WRITE_ATTEMPTS: u32 = 3;

/// Initial backoff between write attempts, doubled after each failure.
const WRITE_INITIAL_BACKOFF_MS: u64 = 500;

/// Results sent from background tasks back to the app.
#[derive(Debug)]
pub enum SyncMessage {
    /// Debounced changes from the listener
    Remote(ChangeBatch),
    /// An optimistic check-in reached the store
    WriteConfirmed { event_id: String, entry_id: String },
    /// An optimistic check-in could not be written
    WriteFailed {
        event_id: String,
        entry_id: String,
        error: String,
    },
    RemoveConfirmed { event_id: String, entry_id: String },
    RemoveFailed {
        event_id: String,
        entry_id: String,
        error: String,
    },
    /// Background event list refresh
    EventsRefreshed(Vec<Event>),
    /// Background entry load for one event
    EntriesLoaded {
        event_id: String,
        entries: Vec<AttendanceEntry>,
        listed_at: DateTime<Utc>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: WRITE_ATTEMPTS,
            initial_backoff: Duration::from_millis(WRITE_INITIAL_BACKOFF_MS),
        }
    }
}

/// Run `op`, retrying transient store errors with exponential backoff.
pub async fn with_retry<F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> StoreResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<()>>,
{
    let mut attempt = 1;
    let mut backoff = policy.initial_backoff;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "Store write failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write an entry, then bump its event and group counters.
///
/// A counter failure after the entry landed is logged and not reported:
/// the entry exists, and the counters can be repaired with a recount.
pub async fn write_entry(
    store: &dyn DocumentStore,
    entry: &AttendanceEntry,
    policy: RetryPolicy,
) -> StoreResult<()> {
    with_retry(policy, "put_entry", || store.put_entry(entry)).await?;
    debug!(event_id = %entry.event_id, entry_id = %entry.id, "Entry written");

    if let Err(e) = with_retry(policy, "adjust_counts", || {
        store.adjust_counts(&entry.event_id, entry.group.as_deref(), 1)
    })
    .await
    {
        warn!(event_id = %entry.event_id, entry_id = %entry.id, error = %e, "Counter increment failed, counters need a recount");
    }
    Ok(())
}

/// Delete an entry, then decrement its counters.
pub async fn delete_entry(
    store: &dyn DocumentStore,
    entry: &AttendanceEntry,
    policy: RetryPolicy,
) -> StoreResult<()> {
    with_retry(policy, "delete_entry", || {
        store.delete_entry(&entry.event_id, &entry.id)
    })
    .await?;
    debug!(event_id = %entry.event_id, entry_id = %entry.id, "Entry deleted");

    if let Err(e) = with_retry(policy, "adjust_counts", || {
        store.adjust_counts(&entry.event_id, entry.group.as_deref(), -1)
    })
    .await
    {
        warn!(event_id = %entry.event_id, entry_id = %entry.id, error = %e, "Counter decrement failed, counters need a recount");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, PersonRecord};
    use crate::store::{MemoryStore, StoreError};
    use chrono::Utc;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    async fn store_with_event() -> MemoryStore {
        let store = MemoryStore::new();
        let start = Utc::now();
        store
            .insert_event(Event {
                id: "e1".to_string(),
                name: "Fair".to_string(),
                target_count: 10,
                current_count: 0,
                start,
                end: start + chrono::Duration::hours(1),
                status: EventStatus::Active,
                groups: vec![],
            })
            .await;
        store
    }

    fn entry() -> AttendanceEntry {
        AttendanceEntry::new(
            "e1",
            PersonRecord {
                id_number: "12345678901".to_string(),
                name: "Alan".to_string(),
                surname: "Turing".to_string(),
                valid_until: None,
            },
            "desk1",
            None,
        )
    }

    #[tokio::test]
    async fn test_write_entry_retries_transient_failures() {
        let store = store_with_event().await;
        store.fail_next_writes(2);
        write_entry(&store, &entry(), quick()).await.unwrap();

        assert_eq!(store.list_entries("e1").await.unwrap().len(), 1);
        let event = store.get_event("e1").await.unwrap().unwrap();
        assert_eq!(event.current_count, 1);
    }

    #[tokio::test]
    async fn test_write_entry_gives_up_after_attempts() {
        let store = store_with_event().await;
        store.fail_next_writes(3);
        let err = write_entry(&store, &entry(), quick()).await.unwrap_err();
        assert!(matches!(err, StoreError::ServerError(_)));
        assert!(store.list_entries("e1").await.unwrap().is_empty());
        assert_eq!(store.get_event("e1").await.unwrap().unwrap().current_count, 0);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let store = MemoryStore::new();
        let err = write_entry(&store, &entry(), quick()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_entry_decrements() {
        let store = store_with_event().await;
        let e = entry();
        write_entry(&store, &e, quick()).await.unwrap();
        delete_entry(&store, &e, quick()).await.unwrap();

        assert!(store.list_entries("e1").await.unwrap().is_empty());
        assert_eq!(store.get_event("e1").await.unwrap().unwrap().current_count, 0);
    }
}
