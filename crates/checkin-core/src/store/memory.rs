//! In-process document store.
//!
//! Keeps every collection behind one `RwLock`, records an entry change log
//! for `changes_since`, and pushes each change on a broadcast channel the
//! way a hosted real-time database would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use super::{Change, CounterSnapshot, DocumentStore, StoreError, StoreResult};
use crate::models::{AttendanceEntry, Event, PersonRecord, User};

/// Capacity of the push channel before slow receivers start lagging.
const PUSH_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Collections {
    events: HashMap<String, Event>,
    // event id -> entry id -> entry
    entries: HashMap<String, HashMap<String, AttendanceEntry>>,
    changes: Vec<Change>,
    persons: HashMap<String, PersonRecord>,
    users: HashMap<String, User>,
}

pub struct MemoryStore {
    inner: RwLock<Collections>,
    push_tx: broadcast::Sender<Change>,
    push_enabled: bool,
    /// Remaining writes to fail with a server error, for exercising retries.
    fail_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_push_capacity(PUSH_CHANNEL_CAPACITY)
    }

    pub fn with_push_capacity(capacity: usize) -> Self {
        let (push_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Collections::default()),
            push_tx,
            push_enabled: true,
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// A store without a push feed; listeners fall back to polling.
    pub fn polling() -> Self {
        Self {
            push_enabled: false,
            ..Self::new()
        }
    }

    pub async fn insert_person(&self, person: PersonRecord) {
        let mut inner = self.inner.write().await;
        inner.persons.insert(person.id_number.clone(), person);
    }

    pub async fn insert_user(&self, user: User) {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id.clone(), user);
    }

    pub async fn insert_event(&self, event: Event) {
        let mut inner = self.inner.write().await;
        inner.events.insert(event.id.clone(), event);
    }

    /// Make the next `count` entry writes fail with a server error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    fn check_write_failure(&self) -> StoreResult<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::ServerError("injected write failure".to_string()));
        }
        Ok(())
    }

    fn publish(&self, inner: &mut Collections, change: Change) {
        inner.changes.push(change.clone());
        // No receivers is fine; the change log still serves pollers.
        let _ = self.push_tx.send(change);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_events(&self) -> StoreResult<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner.events.values().cloned().collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        Ok(self.inner.read().await.events.get(event_id).cloned())
    }

    async fn put_event(&self, event: &Event) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.events.remove(event_id).is_none() {
            return Err(StoreError::NotFound(format!("events/{}", event_id)));
        }
        inner.entries.remove(event_id);
        Ok(())
    }

    async fn list_entries(&self, event_id: &str) -> StoreResult<Vec<AttendanceEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<AttendanceEntry> = inner
            .entries
            .get(event_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(entries)
    }

    async fn put_entry(&self, entry: &AttendanceEntry) -> StoreResult<()> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        if !inner.events.contains_key(&entry.event_id) {
            return Err(StoreError::NotFound(format!("events/{}", entry.event_id)));
        }
        let previous = inner
            .entries
            .entry(entry.event_id.clone())
            .or_default()
            .insert(entry.id.clone(), entry.clone());
        let change = match previous {
            Some(_) => Change::modified(entry.clone()),
            None => Change::added(entry.clone()),
        };
        self.publish(&mut inner, change);
        Ok(())
    }

    async fn delete_entry(&self, event_id: &str, entry_id: &str) -> StoreResult<()> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let removed = inner
            .entries
            .get_mut(event_id)
            .and_then(|m| m.remove(entry_id));
        if removed.is_some() {
            self.publish(&mut inner, Change::removed(event_id, entry_id));
        }
        Ok(())
    }

    async fn adjust_counts(
        &self,
        event_id: &str,
        group: Option<&str>,
        delta: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let event = inner
            .events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("events/{}", event_id)))?;
        event.apply_count_delta(group, delta);
        Ok(())
    }

    async fn set_counts(&self, event_id: &str, counts: &CounterSnapshot) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let event = inner
            .events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("events/{}", event_id)))?;
        event.current_count = counts.current_count;
        for group in &mut event.groups {
            group.current_count = counts.groups.get(&group.name).copied().unwrap_or(0);
        }
        Ok(())
    }

    async fn changes_since(
        &self,
        event_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Change>> {
        let inner = self.inner.read().await;
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.event_id == event_id)
            .filter(|c| since.map(|ts| c.at >= ts).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn find_person(&self, id_number: &str) -> StoreResult<Option<PersonRecord>> {
        Ok(self.inner.read().await.persons.get(id_number).cloned())
    }

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn put_user(&self, user: &User) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn push_channel(&self) -> Option<broadcast::Receiver<Change>> {
        self.push_enabled.then(|| self.push_tx.subscribe())
    }
}
