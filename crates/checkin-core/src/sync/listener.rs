//! Background listener for one event's attendance changes.
//!
//! Uses the store's push feed when it has one and polls `changes_since`
//! otherwise. Pushed changes are debounced so a burst of scans from other
//! desks arrives as a single batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::SyncMessage;
use crate::store::{Change, ChangeBatch, ChangeKind, DocumentStore};

/// Default debounce window for pushed changes.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Default polling interval for stores without a push feed.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

/// Start listening for changes to `event_id`. The task ends when the
/// receiving side of `tx` is dropped.
pub fn spawn_listener(
    store: Arc<dyn DocumentStore>,
    event_id: String,
    config: ListenerConfig,
    tx: mpsc::Sender<SyncMessage>,
) -> JoinHandle<()> {
    // Subscribe before spawning. Callers start the listener before listing
    // entries, so nothing written after the listing is missed.
    let push = store.push_channel();

    tokio::spawn(async move {
        match push {
            Some(rx) => {
                info!(event_id = %event_id, "Listening on push feed");
                run_push(rx, &event_id, config.debounce, &tx).await;
            }
            None => {
                info!(event_id = %event_id, interval = ?config.poll_interval, "Polling for changes");
                run_poll(store, &event_id, config.poll_interval, &tx).await;
            }
        }
        debug!(event_id = %event_id, "Listener stopped");
    })
}

fn new_batch(event_id: &str) -> ChangeBatch {
    ChangeBatch {
        event_id: event_id.to_string(),
        ..Default::default()
    }
}

/// Fold one receive result into the batch. Returns false when the feed closed.
fn collect(batch: &mut ChangeBatch, received: Result<Change, RecvError>) -> bool {
    match received {
        Ok(change) => {
            if change.event_id == batch.event_id {
                batch.changes.push(change);
            }
            true
        }
        Err(RecvError::Lagged(skipped)) => {
            warn!(event_id = %batch.event_id, skipped, "Push feed lagged, requesting resync");
            batch.resync = true;
            true
        }
        Err(RecvError::Closed) => false,
    }
}

async fn run_push(
    mut rx: broadcast::Receiver<Change>,
    event_id: &str,
    debounce: Duration,
    tx: &mpsc::Sender<SyncMessage>,
) {
    loop {
        let first = tokio::select! {
            received = rx.recv() => received,
            _ = tx.closed() => return,
        };

        let mut batch = new_batch(event_id);
        let mut open = collect(&mut batch, first);

        if open {
            let deadline = Instant::now() + debounce;
            while let Ok(received) = tokio::time::timeout_at(deadline, rx.recv()).await {
                if !collect(&mut batch, received) {
                    open = false;
                    break;
                }
            }
        }

        if !batch.changes.is_empty() || batch.resync {
            debug!(event_id, changes = batch.changes.len(), resync = batch.resync, "Delivering batch");
            if tx.send(SyncMessage::Remote(batch)).await.is_err() {
                return;
            }
        }

        if !open {
            warn!(event_id, "Push feed closed");
            return;
        }
    }
}

/// Position in an event's change log. `changes_since` is inclusive, so the
/// changes already delivered at the cursor instant are remembered and
/// filtered out of the next poll.
#[derive(Debug, Default)]
struct PollCursor {
    since: Option<DateTime<Utc>>,
    delivered_at_since: HashSet<(String, ChangeKind)>,
}

impl PollCursor {
    fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// Drop already delivered changes and move the cursor past the rest.
    fn advance(&mut self, changes: Vec<Change>) -> Vec<Change> {
        let fresh: Vec<Change> = changes
            .into_iter()
            .filter(|c| match self.since {
                None => true,
                Some(since) if c.at > since => true,
                Some(since) if c.at == since => !self
                    .delivered_at_since
                    .contains(&(c.entry_id.clone(), c.kind)),
                Some(_) => false,
            })
            .collect();

        if let Some(latest) = fresh.iter().map(|c| c.at).max() {
            if self.since != Some(latest) {
                self.since = Some(latest);
                self.delivered_at_since.clear();
            }
            self.delivered_at_since.extend(
                fresh
                    .iter()
                    .filter(|c| c.at == latest)
                    .map(|c| (c.entry_id.clone(), c.kind)),
            );
        }
        fresh
    }
}

async fn run_poll(
    store: Arc<dyn DocumentStore>,
    event_id: &str,
    interval: Duration,
    tx: &mpsc::Sender<SyncMessage>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Replaying the full log on the first poll is harmless: merging is idempotent.
    let mut cursor = PollCursor::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tx.closed() => return,
        }

        let changes = match store.changes_since(event_id, cursor.since()).await {
            Ok(changes) => cursor.advance(changes),
            Err(e) => {
                warn!(event_id, error = %e, "Change poll failed");
                continue;
            }
        };
        if changes.is_empty() {
            continue;
        }

        let batch = ChangeBatch {
            event_id: event_id.to_string(),
            changes,
            resync: false,
        };
        if tx.send(SyncMessage::Remote(batch)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceEntry, Event, EventStatus, PersonRecord};
    use crate::store::{ChangeKind, MemoryStore};

    fn event(id: &str) -> Event {
        let start = Utc::now();
        Event {
            id: id.to_string(),
            name: "Fair".to_string(),
            target_count: 0,
            current_count: 0,
            start,
            end: start + chrono::Duration::hours(2),
            status: EventStatus::Active,
            groups: vec![],
        }
    }

    fn entry(event_id: &str, id_number: &str) -> AttendanceEntry {
        AttendanceEntry::new(
            event_id,
            PersonRecord {
                id_number: id_number.to_string(),
                name: "Grace".to_string(),
                surname: "Hopper".to_string(),
                valid_until: None,
            },
            "desk2",
            None,
        )
    }

    fn fast() -> ListenerConfig {
        ListenerConfig {
            debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
        }
    }

    async fn next_batch(rx: &mut mpsc::Receiver<SyncMessage>) -> ChangeBatch {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("listener timed out")
            .expect("channel closed");
        match msg {
            SyncMessage::Remote(batch) => batch,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_changes_are_debounced_into_one_batch() {
        let store = Arc::new(MemoryStore::new());
        store.insert_event(event("e1")).await;
        store.insert_event(event("e2")).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = spawn_listener(store.clone(), "e1".to_string(), fast(), tx);

        store.put_entry(&entry("e1", "11111111111")).await.unwrap();
        store.put_entry(&entry("e2", "33333333333")).await.unwrap();
        store.put_entry(&entry("e1", "22222222222")).await.unwrap();

        let batch = next_batch(&mut rx).await;
        assert_eq!(batch.event_id, "e1");
        assert_eq!(batch.changes.len(), 2);
        assert!(batch.changes.iter().all(|c| c.kind == ChangeKind::Added));
        assert!(!batch.resync);
    }

    #[tokio::test]
    async fn test_lagged_feed_requests_resync() {
        let store = Arc::new(MemoryStore::with_push_capacity(1));
        store.insert_event(event("e1")).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = spawn_listener(store.clone(), "e1".to_string(), fast(), tx);

        for n in 0..4 {
            store
                .put_entry(&entry("e1", &format!("1000000000{}", n)))
                .await
                .unwrap();
        }

        let batch = next_batch(&mut rx).await;
        assert!(batch.resync);
    }

    #[tokio::test]
    async fn test_polling_fallback() {
        let store = Arc::new(MemoryStore::polling());
        store.insert_event(event("e1")).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = spawn_listener(store.clone(), "e1".to_string(), fast(), tx);

        let e = entry("e1", "11111111111");
        store.put_entry(&e).await.unwrap();
        let batch = next_batch(&mut rx).await;
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].entry_id, e.id);

        store.delete_entry("e1", &e.id).await.unwrap();
        let batch = next_batch(&mut rx).await;
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].kind, ChangeKind::Removed);
    }

    #[test]
    fn test_poll_cursor_keeps_changes_sharing_the_last_instant() {
        let first = entry("e1", "11111111111");
        let second = entry("e1", "22222222222");
        let mut a = Change::added(first.clone());
        let mut b = Change::added(second);
        b.at = a.at;

        let mut cursor = PollCursor::default();
        assert_eq!(cursor.advance(vec![a.clone()]).len(), 1);
        assert_eq!(cursor.since(), Some(a.at));

        // Written after the last poll but stamped with the same instant.
        let fresh = cursor.advance(vec![a.clone(), b.clone()]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].entry_id, b.entry_id);

        // Nothing new at the same instant.
        assert!(cursor.advance(vec![a.clone(), b.clone()]).is_empty());

        // Removal of the first entry at the same instant is a different change.
        let mut removed = Change::removed("e1", &first.id);
        removed.at = a.at;
        assert_eq!(cursor.advance(vec![a.clone(), b.clone(), removed]).len(), 1);

        // A later change moves the cursor on.
        a.at += chrono::Duration::milliseconds(5);
        let fresh = cursor.advance(vec![b, a.clone()]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(cursor.since(), Some(a.at));
    }

    #[tokio::test]
    async fn test_listener_stops_when_receiver_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_listener(store, "e1".to_string(), fast(), tx);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
