//! Check-in controller.
//!
//! `CheckinApp` ties the document store, the local cache, the session and
//! the in-memory event/attendance state together. Store writes and change
//! listeners run as background tasks and report back through an MPSC
//! channel, drained by `process_sync_messages`, `next_message` or `settle`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthError, CredentialStore, Session, SessionData};
use crate::cache::{CacheAges, CacheManager, EVENTS_STALE_MINUTES};
use crate::config::Config;
use crate::conflict::{self, Conflict, ConflictReport};
use crate::events::EventList;
use crate::models::{
    mask_id_number, validate_event, AttendanceEntry, Event, EventStatus, EventValidationError,
    NewEvent, PersonRecord, Role, User,
};
use crate::stats::{self, EventStats, QuotaError};
use crate::store::{ChangeBatch, CounterSnapshot, DocumentStore, StoreError};
use crate::sync::{
    self, spawn_listener, AttendanceIndex, MergeOutcome, PendingOp, RetryPolicy, SyncError,
    SyncMessage,
};
use crate::utils::{validate_id_number, IdNumberError};

// ============================================================================
// Constants
// ============================================================================

/// Buffer size for the background task message channel.
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Maximum concurrent entry list fetches when loading overlapping events.
const MAX_CONCURRENT_REQUESTS: usize = 5;

/// Upper bound on how long `settle` waits for outstanding writes.
const SETTLE_MAX_WAIT_SECS: u64 = 30;

/// Minimum gap between event refresh attempts while the store is unreachable.
const OFFLINE_RETRY_SECS: u64 = 60;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CheckInError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid id number: {0}")]
    InvalidIdNumber(#[from] IdNumberError),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Event is not active: {0}")]
    EventNotActive(String),

    #[error("Already checked in at {} by {}", hhmmss(.recorded_at), .recorded_by)]
    AlreadyCheckedIn {
        entry_id: String,
        recorded_at: DateTime<Utc>,
        recorded_by: String,
    },

    #[error("Already checked in to an overlapping event: {}", describe_conflicts(.0))]
    Conflict(Vec<Conflict>),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("No person record for id number {0}")]
    PersonNotFound(String),

    #[error("Person record expired on {valid_until}")]
    PersonExpired { valid_until: NaiveDate },

    #[error(transparent)]
    Entry(#[from] SyncError),

    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventValidationError),

    #[error("Event {event_id} still has {count} entries")]
    EventHasEntries { event_id: String, count: usize },

    #[error("Writes for event {0} are still pending - try again once they finish")]
    WritesPending(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn hhmmss(at: &DateTime<Utc>) -> String {
    at.format("%H:%M:%S").to_string()
}

fn describe_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} ({} at {})", c.event_name, c.recorded_by, hhmmss(&c.recorded_at)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckInOptions {
    /// Let an admin check someone in despite overlapping attendance.
    pub allow_conflicts: bool,
}

// ============================================================================
// Controller
// ============================================================================

pub struct CheckinApp {
    store: Arc<dyn DocumentStore>,
    cache: CacheManager,
    session: Session,
    config: Config,
    events: EventList,
    index: AttendanceIndex,
    // id number -> person, for repeat lookups during a shift
    persons: HashMap<String, PersonRecord>,
    listeners: HashMap<String, JoinHandle<()>>,
    sync_tx: mpsc::Sender<SyncMessage>,
    sync_rx: mpsc::Receiver<SyncMessage>,
    // entry ids with a background write or delete running
    in_flight: HashSet<String>,
    retry: RetryPolicy,
    // when the event list (and its counters) last came from the store
    events_fetched_at: Option<DateTime<Utc>>,
    last_refresh_failure: Option<Instant>,

    pub status_message: Option<String>,
    pub cache_ages: CacheAges,
}

/// Open the local cache, sealed with the keychain-held key when configured.
pub fn open_cache(config: &Config) -> anyhow::Result<CacheManager> {
    let dir = config.cache_dir()?;
    if config.encrypt_cache {
        let key = CredentialStore::cache_key(CacheManager::generate_key).context(
            "Cache encryption key unavailable - set encrypt_cache to false to use a plain cache",
        )?;
        CacheManager::with_encryption(dir, &key)
    } else {
        CacheManager::new(dir)
    }
}

impl CheckinApp {
    pub fn new(store: Arc<dyn DocumentStore>, config: Config, cache: CacheManager) -> Self {
        let mut session = Session::new(cache.cache_dir().to_path_buf());
        match session.load() {
            Ok(found) => debug!(found, "Session loaded"),
            Err(e) => warn!(error = %e, "Failed to load session"),
        }

        let (sync_tx, sync_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let cache_ages = cache.get_cache_ages();

        Self {
            store,
            cache,
            session,
            config,
            events: EventList::new(),
            index: AttendanceIndex::new(),
            persons: HashMap::new(),
            listeners: HashMap::new(),
            sync_tx,
            sync_rx,
            in_flight: HashSet::new(),
            retry: RetryPolicy::default(),
            events_fetched_at: None,
            last_refresh_failure: None,
            status_message: None,
            cache_ages,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ===== Accessors =====

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    /// Visible entries for an event, oldest first. Empty until loaded.
    pub fn entries(&self, event_id: &str) -> Vec<&AttendanceEntry> {
        self.index.entries(event_id)
    }

    pub fn find_entry(&self, event_id: &str, id_number: &str) -> Option<&AttendanceEntry> {
        self.index.get(event_id)?.find_by_id_number(id_number)
    }

    /// Optimistic operations not yet acknowledged by the store.
    pub fn pending_count(&self) -> usize {
        self.index.pending_count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_watching(&self, event_id: &str) -> bool {
        self.listeners
            .get(event_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // ===== Session =====

    pub async fn login(&mut self, username: &str, password: &str) -> Result<SessionData, CheckInError> {
        let data = auth::authenticate(self.store.as_ref(), username, password).await?;
        self.session.update(data.clone());
        if let Err(e) = self.session.save() {
            warn!(error = %e, "Failed to save session");
        }
        self.config.last_username = Some(data.username.clone());
        Ok(data)
    }

    pub fn logout(&mut self) {
        self.stop_listeners();
        if let Err(e) = self.session.clear() {
            warn!(error = %e, "Failed to clear session");
        }
        self.persons.clear();
        info!("Logged out");
    }

    /// Remove every cached document. The session is kept.
    pub fn clear_cache(&mut self) -> anyhow::Result<()> {
        self.cache.clear()?;
        self.cache_ages = self.cache.get_cache_ages();
        Ok(())
    }

    // ===== Loading =====

    /// Load the event list and unacknowledged check-ins from disk.
    /// Returns whether a cached event list was found.
    pub fn load_from_cache(&mut self) -> bool {
        let mut found = false;
        match self.cache.load_events() {
            Ok(Some(cached)) => {
                debug!(count = cached.data.len(), age = %cached.age_display(), "Events loaded from cache");
                self.events.replace(cached.data);
                found = true;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load cached events"),
        }

        match self.cache.load_pending() {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!(count = pending.len(), "Restored unsent check-ins");
                }
                for entry in pending {
                    let event_id = entry.event_id.clone();
                    self.index.get_or_create(&event_id).add_pending(entry);
                }
            }
            Err(e) => warn!(error = %e, "Failed to load pending check-ins"),
        }

        if found && self.cache.any_stale(self.events.active().into_iter().map(|e| e.id.as_str())) {
            self.status_message = Some(format!("Cached data is stale ({})", self.cache.get_cache_ages().events_age()));
        }
        self.cache_ages = self.cache.get_cache_ages();
        found
    }

    pub async fn refresh_events(&mut self) -> Result<usize, CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        let events = self.store.list_events().await?;
        let count = events.len();
        self.set_events(events);
        info!(count, "Events refreshed");
        Ok(count)
    }

    /// Refresh the event list in a background task; the result arrives
    /// as `SyncMessage::EventsRefreshed`.
    pub fn spawn_refresh_events(&self) -> Result<(), CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        let store = Arc::clone(&self.store);
        let tx = self.sync_tx.clone();
        tokio::spawn(async move {
            let msg = match store.list_events().await {
                Ok(events) => SyncMessage::EventsRefreshed(events),
                Err(e) => {
                    error!(error = %e, "Events fetch failed");
                    SyncMessage::Error(format!("Event refresh failed: {}", e))
                }
            };
            Self::send_message(&tx, msg).await;
        });
        Ok(())
    }

    /// Fetch an event's entries from the store, replacing the local copy,
    /// and start listening for its changes.
    pub async fn load_entries(&mut self, event_id: &str) -> Result<usize, CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        // Listen before listing; the merge absorbs changes seen twice.
        self.ensure_watching(event_id);
        let listed_at = Utc::now();
        let entries = self.store.list_entries(event_id).await?;
        self.install_entries(event_id, entries, listed_at);
        Ok(self.index.entries(event_id).len())
    }

    /// Make sure an event's entries are loaded and kept live.
    pub async fn watch_event(&mut self, event_id: &str) -> Result<(), CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        self.ensure_events().await?;
        self.resolve_event(event_id).await?;
        self.ensure_loaded(vec![event_id.to_string()]).await?;
        self.ensure_watching(event_id);
        Ok(())
    }

    // ===== Check-in =====

    pub async fn check_in(
        &mut self,
        event_id: &str,
        raw_id_number: &str,
        group: Option<&str>,
        options: CheckInOptions,
    ) -> Result<AttendanceEntry, CheckInError> {
        let user = auth::require(&self.session, Role::Staff)?;
        let recorded_by = user.username.clone();
        let is_admin = user.has_role(Role::Admin);

        let id_number = validate_id_number(raw_id_number, self.config.id_number_length)?;

        self.ensure_events().await?;
        let event = self.resolve_event(event_id).await?;
        if !event.is_active() {
            return Err(CheckInError::EventNotActive(event.name));
        }

        let mut related = vec![event.id.clone()];
        related.extend(self.events.overlapping(&event.id).iter().map(|e| e.id.clone()));
        self.ensure_loaded(related.clone()).await?;
        for id in &related {
            self.ensure_watching(id);
        }

        if let Some(existing) = conflict::find_duplicate(self.index.entries(&event.id), &id_number) {
            return Err(CheckInError::AlreadyCheckedIn {
                entry_id: existing.id.clone(),
                recorded_at: existing.recorded_at,
                recorded_by: existing.recorded_by.clone(),
            });
        }

        let conflicts = conflict::find_conflicts(&event, self.events.all(), &self.index, &id_number);
        if !conflicts.is_empty() {
            if options.allow_conflicts && is_admin {
                warn!(event_id = %event.id, conflicts = conflicts.len(), "Checking in despite overlapping attendance");
            } else {
                return Err(CheckInError::Conflict(conflicts));
            }
        }

        // Counters include merged remote changes; the loaded entries bound
        // them from below in case the counters lag.
        let current = self.events.get(&event.id).unwrap_or(&event);
        stats::check_quota(&stats::with_entry_floor(current, &self.index.entries(&event.id)), group)?;

        let person = self.lookup_person(&id_number).await?;
        let event_day = event.start.date_naive();
        if let Some(valid_until) = person.valid_until.filter(|until| *until < event_day) {
            return Err(CheckInError::PersonExpired { valid_until });
        }

        let entry = AttendanceEntry::new(&event.id, person, &recorded_by, group.map(str::to_string));
        self.index.get_or_create(&event.id).add_pending(entry.clone());
        self.events.apply_count_delta(&event.id, entry.group.as_deref(), 1);
        self.persist_entries(&event.id);
        self.persist_pending();
        self.persist_events();

        info!(
            event_id = %event.id,
            entry_id = %entry.id,
            person = %entry.person.masked_id_number(),
            "Checked in"
        );
        self.spawn_write(entry.clone());
        Ok(entry)
    }

    pub async fn remove_entry(&mut self, event_id: &str, entry_id: &str) -> Result<AttendanceEntry, CheckInError> {
        auth::require(&self.session, Role::Staff)?;
        self.ensure_loaded(vec![event_id.to_string()]).await?;

        let entry = self
            .index
            .get_or_create(event_id)
            .remove_pending(entry_id)?;
        self.events.apply_count_delta(event_id, entry.group.as_deref(), -1);
        self.persist_entries(event_id);
        self.persist_events();

        info!(event_id, entry_id, "Entry removed");
        self.spawn_remove(entry.clone());
        Ok(entry)
    }

    /// Re-send check-ins that were never acknowledged, e.g. after a restart.
    pub fn flush_pending(&mut self) -> Result<usize, CheckInError> {
        auth::require(&self.session, Role::Staff)?;
        let unsent: Vec<AttendanceEntry> = self
            .index
            .pending_adds()
            .into_iter()
            .filter(|e| !self.in_flight.contains(&e.id))
            .collect();
        let count = unsent.len();
        for entry in unsent {
            self.spawn_write(entry);
        }
        if count > 0 {
            info!(count, "Replaying unsent check-ins");
        }
        Ok(count)
    }

    // ===== Reports =====

    pub async fn event_stats(&mut self, event_id: &str) -> Result<EventStats, CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        self.ensure_events().await?;
        let event = self.resolve_event(event_id).await?;
        self.ensure_loaded(vec![event_id.to_string()]).await?;
        let event = self.events.get(event_id).unwrap_or(&event);
        Ok(EventStats::compute(event, &self.index.entries(event_id)))
    }

    /// Every person checked in to two overlapping active events.
    pub async fn conflict_report(&mut self) -> Result<Vec<ConflictReport>, CheckInError> {
        auth::require(&self.session, Role::Viewer)?;
        self.ensure_events().await?;
        let ids: Vec<String> = self.events.active().iter().map(|e| e.id.clone()).collect();
        self.ensure_loaded(ids).await?;
        let active: Vec<Event> = self.events.active().into_iter().cloned().collect();
        Ok(conflict::scan_conflicts(&active, &self.index))
    }

    /// Recompute an event's counters from its entries and write them back.
    pub async fn reconcile_counts(&mut self, event_id: &str) -> Result<CounterSnapshot, CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        if self.index.get(event_id).map(|c| c.pending_count()).unwrap_or(0) > 0 {
            return Err(CheckInError::WritesPending(event_id.to_string()));
        }

        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| CheckInError::EventNotFound(event_id.to_string()))?;
        let listed_at = Utc::now();
        let entries = self.store.list_entries(event_id).await?;
        self.install_entries(event_id, entries, listed_at);

        let snapshot = stats::recount(&event, &self.index.entries(event_id));
        self.store.set_counts(event_id, &snapshot).await?;

        let mut updated = event;
        let drift = i64::from(updated.current_count) - i64::from(snapshot.current_count);
        updated.current_count = snapshot.current_count;
        for group in &mut updated.groups {
            group.current_count = snapshot.groups.get(&group.name).copied().unwrap_or(0);
        }
        self.events.upsert(updated);
        self.persist_events();

        info!(event_id, count = snapshot.current_count, drift, "Counters reconciled");
        Ok(snapshot)
    }

    // ===== Event administration =====

    pub async fn create_event(&mut self, new: NewEvent) -> Result<Event, CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        let event = Event::from_new(new)?;
        self.store.put_event(&event).await?;
        info!(event_id = %event.id, name = %event.name, "Event created");
        self.events.upsert(event.clone());
        self.persist_events();
        Ok(event)
    }

    /// Replace an event's definition. Counters are kept from the store.
    pub async fn update_event(&mut self, event: Event) -> Result<Event, CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        validate_event(&event)?;
        let existing = self
            .store
            .get_event(&event.id)
            .await?
            .ok_or_else(|| CheckInError::EventNotFound(event.id.clone()))?;

        let mut updated = event;
        updated.current_count = existing.current_count;
        for group in &mut updated.groups {
            group.current_count = existing
                .group(&group.name)
                .map(|g| g.current_count)
                .unwrap_or(0);
        }
        self.store.put_event(&updated).await?;
        info!(event_id = %updated.id, "Event updated");
        self.events.upsert(updated.clone());
        self.persist_events();
        Ok(updated)
    }

    pub async fn set_event_status(&mut self, event_id: &str, status: EventStatus) -> Result<Event, CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        let mut event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| CheckInError::EventNotFound(event_id.to_string()))?;
        event.status = status;
        self.store.put_event(&event).await?;
        info!(event_id, %status, "Event status changed");
        self.events.upsert(event.clone());
        self.persist_events();
        Ok(event)
    }

    /// Delete an event. Refused while it still has entries.
    pub async fn delete_event(&mut self, event_id: &str) -> Result<(), CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        if self.store.get_event(event_id).await?.is_none() {
            return Err(CheckInError::EventNotFound(event_id.to_string()));
        }
        let count = self.store.list_entries(event_id).await?.len();
        let pending = self.index.get(event_id).map(|c| c.pending_count()).unwrap_or(0);
        if count > 0 || pending > 0 {
            return Err(CheckInError::EventHasEntries {
                event_id: event_id.to_string(),
                count: count + pending,
            });
        }

        self.store.delete_event(event_id).await?;
        self.events.remove(event_id);
        self.index.remove(event_id);
        if let Some(handle) = self.listeners.remove(event_id) {
            handle.abort();
        }
        if let Err(e) = self.cache.remove_entries(event_id) {
            warn!(event_id, error = %e, "Failed to remove cached entries");
        }
        self.persist_events();
        info!(event_id, "Event deleted");
        Ok(())
    }

    // ===== User administration =====

    pub async fn add_user(&mut self, username: &str, password: &str, roles: Vec<Role>) -> Result<User, CheckInError> {
        auth::require(&self.session, Role::Admin)?;
        let username = username.trim();
        if self.store.find_user(username).await?.is_some() {
            return Err(CheckInError::UserExists(username.to_string()));
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: auth::hash_password(password)?,
            roles,
        };
        self.store.put_user(&user).await?;
        info!(username, roles = ?user.roles, "User added");
        Ok(user)
    }

    /// Change a password. Anyone may change their own; admins may change any.
    pub async fn set_password(&mut self, username: &str, new_password: &str) -> Result<(), CheckInError> {
        let own = auth::require(&self.session, Role::Viewer)?
            .username
            .eq_ignore_ascii_case(username.trim());
        if !own {
            auth::require(&self.session, Role::Admin)?;
        }
        auth::set_password(self.store.as_ref(), username.trim(), new_password).await?;
        Ok(())
    }

    // ===== Background results =====

    /// Apply every message already waiting. Returns how many were handled.
    pub fn process_sync_messages(&mut self) -> usize {
        let mut messages = Vec::new();
        while let Ok(msg) = self.sync_rx.try_recv() {
            messages.push(msg);
        }
        let count = messages.len();
        for msg in messages {
            self.handle_message(msg);
        }
        count
    }

    /// Wait up to `wait` for one message and apply it.
    pub async fn next_message(&mut self, wait: Duration) -> bool {
        match tokio::time::timeout(wait, self.sync_rx.recv()).await {
            Ok(Some(msg)) => {
                self.handle_message(msg);
                true
            }
            _ => false,
        }
    }

    /// Handle messages until writes are done and nothing arrives for `quiet`.
    pub async fn settle(&mut self, quiet: Duration) {
        let deadline = Instant::now() + Duration::from_secs(SETTLE_MAX_WAIT_SECS);
        while Instant::now() < deadline {
            if !self.next_message(quiet).await && self.in_flight.is_empty() {
                return;
            }
        }
        warn!(in_flight = self.in_flight.len(), "Gave up waiting for background writes");
    }

    fn handle_message(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Remote(batch) => self.apply_remote(batch),
            SyncMessage::WriteConfirmed { event_id, entry_id } => {
                self.in_flight.remove(&entry_id);
                if let Some(cache) = self.index.get_mut(&event_id) {
                    cache.confirm_write(&entry_id);
                }
                self.persist_pending();
            }
            SyncMessage::WriteFailed {
                event_id,
                entry_id,
                error,
            } => {
                self.in_flight.remove(&entry_id);
                self.roll_back(&event_id, &entry_id);
                self.status_message = Some(format!("Check-in was not saved: {}", error));
            }
            SyncMessage::RemoveConfirmed { event_id, entry_id } => {
                self.in_flight.remove(&entry_id);
                if let Some(cache) = self.index.get_mut(&event_id) {
                    cache.confirm_write(&entry_id);
                }
                self.persist_entries(&event_id);
            }
            SyncMessage::RemoveFailed {
                event_id,
                entry_id,
                error,
            } => {
                self.in_flight.remove(&entry_id);
                self.roll_back(&event_id, &entry_id);
                self.status_message = Some(format!("Removal was not saved: {}", error));
            }
            SyncMessage::EventsRefreshed(events) => self.set_events(events),
            SyncMessage::EntriesLoaded {
                event_id,
                entries,
                listed_at,
            } => {
                self.install_entries(&event_id, entries, listed_at);
            }
            SyncMessage::Error(message) => {
                warn!(%message, "Background task failed");
                self.status_message = Some(message);
            }
        }
    }

    fn apply_remote(&mut self, batch: ChangeBatch) {
        if batch.resync {
            self.spawn_entries_reload(&batch.event_id);
        }
        let Some(cache) = self.index.get_mut(&batch.event_id) else {
            return;
        };
        let outcome = cache.apply_batch(&batch);
        if outcome.is_empty() {
            return;
        }
        debug!(
            event_id = %batch.event_id,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            echoed = outcome.echoed,
            "Remote changes merged"
        );
        self.apply_outcome(&batch.event_id, &outcome);
        self.persist_entries(&batch.event_id);
        if outcome.echoed > 0 {
            self.persist_pending();
        }
    }

    fn roll_back(&mut self, event_id: &str, entry_id: &str) {
        let Some((entry, op)) = self.index.get_mut(event_id).and_then(|c| c.rollback(entry_id)) else {
            return;
        };
        let delta = match op {
            PendingOp::Add => -1,
            PendingOp::Remove => 1,
        };
        warn!(event_id, entry_id, ?op, "Rolled back optimistic change");
        self.events.apply_count_delta(event_id, entry.group.as_deref(), delta);
        self.persist_entries(event_id);
        self.persist_pending();
        self.persist_events();
    }

    // ===== Internals =====

    async fn send_message(tx: &mpsc::Sender<SyncMessage>, msg: SyncMessage) {
        if let Err(e) = tx.send(msg).await {
            error!(error = %e, "Failed to send sync message - channel closed");
        }
    }

    fn spawn_write(&mut self, entry: AttendanceEntry) {
        self.in_flight.insert(entry.id.clone());
        let store = Arc::clone(&self.store);
        let tx = self.sync_tx.clone();
        let retry = self.retry;
        tokio::spawn(async move {
            let result = sync::write_entry(store.as_ref(), &entry, retry).await;
            let msg = match result {
                Ok(()) => SyncMessage::WriteConfirmed {
                    event_id: entry.event_id,
                    entry_id: entry.id,
                },
                Err(e) => {
                    error!(event_id = %entry.event_id, entry_id = %entry.id, error = %e, "Check-in write failed");
                    SyncMessage::WriteFailed {
                        event_id: entry.event_id,
                        entry_id: entry.id,
                        error: e.to_string(),
                    }
                }
            };
            Self::send_message(&tx, msg).await;
        });
    }

    fn spawn_remove(&mut self, entry: AttendanceEntry) {
        self.in_flight.insert(entry.id.clone());
        let store = Arc::clone(&self.store);
        let tx = self.sync_tx.clone();
        let retry = self.retry;
        tokio::spawn(async move {
            let result = sync::delete_entry(store.as_ref(), &entry, retry).await;
            let msg = match result {
                Ok(()) => SyncMessage::RemoveConfirmed {
                    event_id: entry.event_id,
                    entry_id: entry.id,
                },
                Err(e) => {
                    error!(event_id = %entry.event_id, entry_id = %entry.id, error = %e, "Entry delete failed");
                    SyncMessage::RemoveFailed {
                        event_id: entry.event_id,
                        entry_id: entry.id,
                        error: e.to_string(),
                    }
                }
            };
            Self::send_message(&tx, msg).await;
        });
    }

    fn spawn_entries_reload(&self, event_id: &str) {
        let store = Arc::clone(&self.store);
        let tx = self.sync_tx.clone();
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            let listed_at = Utc::now();
            let msg = match store.list_entries(&event_id).await {
                Ok(entries) => SyncMessage::EntriesLoaded {
                    event_id,
                    entries,
                    listed_at,
                },
                Err(e) => SyncMessage::Error(format!("Reload of {} failed: {}", event_id, e)),
            };
            Self::send_message(&tx, msg).await;
        });
    }

    fn ensure_watching(&mut self, event_id: &str) {
        if self.is_watching(event_id) {
            return;
        }
        let handle = spawn_listener(
            Arc::clone(&self.store),
            event_id.to_string(),
            self.config.listener(),
            self.sync_tx.clone(),
        );
        self.listeners.insert(event_id.to_string(), handle);
    }

    fn stop_listeners(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }

    /// Make sure the event list holds store counters no older than the
    /// staleness window. Events from the disk cache are only an offline
    /// fallback.
    async fn ensure_events(&mut self) -> Result<(), CheckInError> {
        let fresh = self
            .events_fetched_at
            .map(|at| Utc::now() - at < chrono::Duration::minutes(EVENTS_STALE_MINUTES))
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        let offline = self
            .last_refresh_failure
            .map(|at| at.elapsed() < Duration::from_secs(OFFLINE_RETRY_SECS))
            .unwrap_or(false);
        if offline && !self.events.is_empty() {
            return Ok(());
        }

        match self.refresh_events().await {
            Ok(_) => {
                self.last_refresh_failure = None;
                Ok(())
            }
            Err(CheckInError::Store(e)) if !self.events.is_empty() || self.load_from_cache() => {
                warn!(error = %e, "Event refresh failed, using cached events");
                self.last_refresh_failure = Some(Instant::now());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_event(&mut self, event_id: &str) -> Result<Event, CheckInError> {
        if let Some(event) = self.events.get(event_id) {
            return Ok(event.clone());
        }
        match self.store.get_event(event_id).await? {
            Some(event) => {
                self.events.upsert(event.clone());
                Ok(event)
            }
            None => Err(CheckInError::EventNotFound(event_id.to_string())),
        }
    }

    /// Load entries for events not yet in memory, concurrently, falling
    /// back to the disk cache when the store is unreachable.
    async fn ensure_loaded(&mut self, event_ids: Vec<String>) -> Result<(), CheckInError> {
        let missing: Vec<String> = event_ids
            .into_iter()
            .filter(|id| !self.index.is_loaded(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        // Listen before listing; the merge absorbs changes seen twice.
        for id in &missing {
            self.ensure_watching(id);
        }

        let listed_at = Utc::now();
        let store = Arc::clone(&self.store);
        let results: Vec<(String, Result<Vec<AttendanceEntry>, StoreError>)> = stream::iter(missing)
            .map(|id| {
                let store = Arc::clone(&store);
                async move {
                    let result = store.list_entries(&id).await;
                    (id, result)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        for (event_id, result) in results {
            match result {
                Ok(entries) => {
                    self.install_entries(&event_id, entries, listed_at);
                }
                Err(e) => match self.cache.load_entries(&event_id) {
                    Ok(Some(cached)) => {
                        warn!(event_id = %event_id, error = %e, age = %cached.age_display(), "Entry fetch failed, using cached entries");
                        self.install_entries(&event_id, cached.data, cached.cached_at);
                    }
                    _ => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    fn install_entries(
        &mut self,
        event_id: &str,
        entries: Vec<AttendanceEntry>,
        listed_at: DateTime<Utc>,
    ) -> MergeOutcome {
        let cache = self.index.get_or_create(event_id);
        let was_loaded = cache.is_loaded();
        let outcome = cache.replace_all_as_of(entries, listed_at);
        // A first load matches the counters already on the event record.
        if was_loaded {
            self.apply_outcome(event_id, &outcome);
        }
        self.persist_entries(event_id);
        outcome
    }

    fn apply_outcome(&mut self, event_id: &str, outcome: &MergeOutcome) {
        for (group, delta) in outcome.count_deltas() {
            self.events.apply_count_delta(event_id, group.as_deref(), delta);
        }
    }

    async fn lookup_person(&mut self, id_number: &str) -> Result<PersonRecord, CheckInError> {
        if let Some(person) = self.persons.get(id_number) {
            return Ok(person.clone());
        }
        let person = self
            .store
            .find_person(id_number)
            .await?
            .ok_or_else(|| CheckInError::PersonNotFound(mask_id_number(id_number)))?;
        self.persons.insert(id_number.to_string(), person.clone());
        Ok(person)
    }

    fn set_events(&mut self, events: Vec<Event>) {
        self.events.replace(events);
        self.events_fetched_at = Some(Utc::now());
        // Store counters cannot include check-ins that were never sent.
        // Writes in flight may or may not be counted yet; the next refresh
        // settles those.
        for entry in self.index.pending_adds() {
            if !self.in_flight.contains(&entry.id) {
                self.events.apply_count_delta(&entry.event_id, entry.group.as_deref(), 1);
            }
        }
        self.persist_events();
        self.cache_ages = self.cache.get_cache_ages();
    }

    fn persist_events(&self) {
        if let Err(e) = self.cache.save_events(self.events.all()) {
            warn!(error = %e, "Failed to cache events");
        }
    }

    fn persist_entries(&self, event_id: &str) {
        let entries: Vec<AttendanceEntry> = self.index.entries(event_id).into_iter().cloned().collect();
        if let Err(e) = self.cache.save_entries(event_id, &entries) {
            warn!(event_id, error = %e, "Failed to cache entries");
        }
    }

    fn persist_pending(&self) {
        if let Err(e) = self.cache.save_pending(&self.index.pending_adds()) {
            warn!(error = %e, "Failed to persist pending check-ins");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventGroup;
    use crate::store::{Change, MemoryStore, StoreResult};
    use tokio::sync::broadcast;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::{Algorithm, Argon2, Params, Version};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    const ALICE: &str = "10000000146";
    const BOB: &str = "20000000292";
    const CAROL: &str = "30000000348";
    const EXPIRED: &str = "40000000484";
    const UNKNOWN: &str = "50000000550";

    const QUIET: Duration = Duration::from_millis(100);

    // Low-cost Argon2 parameters keep the tests fast; verification reads
    // them back from the PHC string.
    fn cheap_hash(password: &str) -> String {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let params = Params::new(256, 1, 1, None).unwrap();
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap()
    }

    fn event(id: &str, start: u32, end: u32, target: u32) -> Event {
        Event {
            id: id.to_string(),
            name: format!("Event {}", id),
            target_count: target,
            current_count: 0,
            start: at(start),
            end: at(end),
            status: EventStatus::Active,
            groups: vec![EventGroup::new("VIP", 1)],
        }
    }

    fn person(id_number: &str, name: &str, valid_until: Option<NaiveDate>) -> PersonRecord {
        PersonRecord {
            id_number: id_number.to_string(),
            name: name.to_string(),
            surname: "Tester".to_string(),
            valid_until,
        }
    }

    fn user(username: &str, password: &str, roles: Vec<Role>) -> User {
        User {
            id: format!("u-{}", username),
            username: username.to_string(),
            password_hash: cheap_hash(password),
            roles,
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
        }
    }

    fn test_config() -> Config {
        Config {
            debounce_ms: 20,
            poll_interval_secs: 1,
            ..Default::default()
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_event(event("morning", 9, 12, 3)).await;
        store.insert_event(event("lunch", 11, 14, 0)).await;
        store.insert_event(event("evening", 18, 21, 0)).await;
        let mut closed = event("closed", 8, 9, 0);
        closed.status = EventStatus::Passive;
        store.insert_event(closed).await;

        store.insert_person(person(ALICE, "Alice", None)).await;
        store.insert_person(person(BOB, "Bob", None)).await;
        store.insert_person(person(CAROL, "Carol", None)).await;
        store
            .insert_person(person(EXPIRED, "Eve", NaiveDate::from_ymd_opt(2026, 3, 13)))
            .await;

        store.insert_user(user("admin", "secret", vec![Role::Admin])).await;
        store.insert_user(user("desk1", "pw1", vec![Role::Staff])).await;
        store.insert_user(user("desk2", "pw2", vec![Role::Staff])).await;
        store.insert_user(user("viewer", "pw3", vec![Role::Viewer])).await;
        store
    }

    fn app_with(store: Arc<MemoryStore>, dir: &TempDir) -> CheckinApp {
        let cache = CacheManager::new(dir.path().to_path_buf()).unwrap();
        CheckinApp::new(store, test_config(), cache).with_retry_policy(quick_retry())
    }

    async fn logged_in(username: &str, password: &str) -> (CheckinApp, Arc<MemoryStore>, TempDir) {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();
        let mut app = app_with(Arc::clone(&store), &dir);
        app.login(username, password).await.unwrap();
        (app, store, dir)
    }

    fn local_count(app: &CheckinApp, event_id: &str) -> u32 {
        app.events().get(event_id).unwrap().current_count
    }

    async fn server_count(store: &MemoryStore, event_id: &str) -> u32 {
        store.get_event(event_id).await.unwrap().unwrap().current_count
    }

    #[tokio::test]
    async fn test_check_in_requires_staff_session() {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();
        let mut app = app_with(Arc::clone(&store), &dir);

        let err = app
            .check_in("morning", ALICE, None, CheckInOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckInError::Auth(AuthError::NotAuthenticated)));

        app.login("viewer", "pw3").await.unwrap();
        let err = app
            .check_in("morning", ALICE, None, CheckInOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckInError::Auth(AuthError::Forbidden { required: Role::Staff })
        ));
    }

    #[tokio::test]
    async fn test_login_errors() {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();
        let mut app = app_with(store, &dir);

        assert!(matches!(
            app.login("desk1", "wrong").await.unwrap_err(),
            CheckInError::Auth(AuthError::IncorrectPassword)
        ));
        assert!(matches!(
            app.login("nobody", "pw").await.unwrap_err(),
            CheckInError::Auth(AuthError::UserNotFound(_))
        ));

        let data = app.login("DESK1", "pw1").await.unwrap();
        assert_eq!(data.username, "desk1");
        assert_eq!(app.config().last_username.as_deref(), Some("desk1"));
        assert!(app.session().is_valid());
    }

    #[tokio::test]
    async fn test_session_survives_restart_until_logout() {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();
        {
            let mut app = app_with(Arc::clone(&store), &dir);
            app.login("desk1", "pw1").await.unwrap();
        }
        let mut app = app_with(Arc::clone(&store), &dir);
        assert_eq!(app.session().username(), Some("desk1"));

        app.logout();
        assert!(!app.session().is_valid());
        let app = app_with(store, &dir);
        assert!(app.session().username().is_none());
    }

    #[tokio::test]
    async fn test_check_in_counts_once_through_echo() {
        let (mut app, store, _dir) = logged_in("desk1", "pw1").await;

        let entry = app
            .check_in("morning", ALICE, None, CheckInOptions::default())
            .await
            .unwrap();
        assert_eq!(entry.recorded_by, "desk1");
        assert_eq!(entry.person.name, "Alice");
        assert_eq!(local_count(&app, "morning"), 1);
        assert_eq!(app.pending_count(), 1);
        assert!(app.is_watching("morning"));
        assert!(app.is_watching("lunch"));

        app.settle(QUIET).await;

        assert_eq!(app.pending_count(), 0);
        assert_eq!(app.in_flight_count(), 0);
        assert_eq!(local_count(&app, "morning"), 1);
        assert_eq!(server_count(&store, "morning").await, 1);
        assert_eq!(store.list_entries("morning").await.unwrap().len(), 1);
        assert_eq!(app.entries("morning").len(), 1);
    }

    #[tokio::test]
    async fn test_input_and_event_validation() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let opts = CheckInOptions::default();

        assert!(matches!(
            app.check_in("morning", "12ab", None, opts).await.unwrap_err(),
            CheckInError::InvalidIdNumber(_)
        ));
        assert!(matches!(
            app.check_in("nope", ALICE, None, opts).await.unwrap_err(),
            CheckInError::EventNotFound(_)
        ));
        assert!(matches!(
            app.check_in("closed", ALICE, None, opts).await.unwrap_err(),
            CheckInError::EventNotActive(_)
        ));
        match app.check_in("morning", UNKNOWN, None, opts).await.unwrap_err() {
            CheckInError::PersonNotFound(masked) => assert!(masked.ends_with("0550") && masked.starts_with('*')),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            app.check_in("morning", EXPIRED, None, opts).await.unwrap_err(),
            CheckInError::PersonExpired { .. }
        ));
        assert_eq!(local_count(&app, "morning"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_check_in_rejected() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let opts = CheckInOptions::default();

        app.check_in("morning", ALICE, None, opts).await.unwrap();
        let err = app.check_in("morning", ALICE, None, opts).await.unwrap_err();
        match err {
            CheckInError::AlreadyCheckedIn { recorded_by, .. } => assert_eq!(recorded_by, "desk1"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(local_count(&app, "morning"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_events_conflict() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let opts = CheckInOptions::default();

        app.check_in("morning", ALICE, None, opts).await.unwrap();
        match app.check_in("lunch", ALICE, None, opts).await.unwrap_err() {
            CheckInError::Conflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].event_id, "morning");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Staff cannot override.
        let err = app
            .check_in("lunch", ALICE, None, CheckInOptions { allow_conflicts: true })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckInError::Conflict(_)));

        // Non-overlapping evening is fine.
        app.check_in("evening", ALICE, None, opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_may_override_conflict() {
        let (mut app, _store, _dir) = logged_in("admin", "secret").await;
        app.check_in("morning", BOB, None, CheckInOptions::default())
            .await
            .unwrap();
        app.check_in("lunch", BOB, None, CheckInOptions { allow_conflicts: true })
            .await
            .unwrap();
        app.settle(QUIET).await;

        let report = app.conflict_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].id_number, BOB);
        assert_eq!(report[0].person_name, "Bob Tester");
    }

    #[tokio::test]
    async fn test_quotas() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let opts = CheckInOptions::default();

        app.check_in("morning", ALICE, Some("VIP"), opts).await.unwrap();
        assert!(matches!(
            app.check_in("morning", BOB, Some("VIP"), opts).await.unwrap_err(),
            CheckInError::Quota(QuotaError::GroupQuotaReached { .. })
        ));
        assert!(matches!(
            app.check_in("morning", BOB, Some("Press"), opts).await.unwrap_err(),
            CheckInError::Quota(QuotaError::UnknownGroup(_))
        ));

        app.check_in("morning", BOB, None, opts).await.unwrap();
        app.check_in("morning", CAROL, None, opts).await.unwrap();
        assert_eq!(local_count(&app, "morning"), 3);

        // Target of 3 reached; quota is checked before the person lookup.
        assert!(matches!(
            app.check_in("morning", UNKNOWN, None, opts).await.unwrap_err(),
            CheckInError::Quota(QuotaError::QuotaReached { target: 3 })
        ));
    }

    #[tokio::test]
    async fn test_remote_check_in_merged_from_listener() {
        let (mut app, store, _dir) = logged_in("desk1", "pw1").await;
        app.watch_event("morning").await.unwrap();
        assert!(app.entries("morning").is_empty());

        // Another desk writes directly to the store.
        let remote = AttendanceEntry::new("morning", person(BOB, "Bob", None), "desk2", Some("VIP".to_string()));
        store.put_entry(&remote).await.unwrap();
        store.adjust_counts("morning", Some("VIP"), 1).await.unwrap();

        app.settle(QUIET).await;
        assert_eq!(app.entries("morning").len(), 1);
        assert_eq!(local_count(&app, "morning"), 1);
        let event = app.events().get("morning").unwrap();
        assert_eq!(event.group("VIP").unwrap().current_count, 1);

        // The remote check-in is now visible as a duplicate.
        let err = app
            .check_in("morning", BOB, None, CheckInOptions::default())
            .await
            .unwrap_err();
        match err {
            CheckInError::AlreadyCheckedIn { recorded_by, .. } => assert_eq!(recorded_by, "desk2"),
            other => panic!("unexpected error: {:?}", other),
        }

        // Remote removal decrements once.
        store.delete_entry("morning", &remote.id).await.unwrap();
        app.settle(QUIET).await;
        assert!(app.entries("morning").is_empty());
        assert_eq!(local_count(&app, "morning"), 0);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let (mut app, store, _dir) = logged_in("desk1", "pw1").await;
        store.fail_next_writes(2);

        app.check_in("morning", ALICE, Some("VIP"), CheckInOptions::default())
            .await
            .unwrap();
        assert_eq!(local_count(&app, "morning"), 1);

        app.settle(QUIET).await;
        assert!(app.entries("morning").is_empty());
        assert_eq!(local_count(&app, "morning"), 0);
        assert_eq!(
            app.events().get("morning").unwrap().group("VIP").unwrap().current_count,
            0
        );
        assert_eq!(app.pending_count(), 0);
        assert!(app.status_message.as_deref().unwrap_or("").contains("not saved"));
        assert!(store.list_entries("morning").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let (mut app, store, _dir) = logged_in("desk1", "pw1").await;
        let entry = app
            .check_in("morning", ALICE, None, CheckInOptions::default())
            .await
            .unwrap();

        // Still being written.
        assert!(matches!(
            app.remove_entry("morning", &entry.id).await.unwrap_err(),
            CheckInError::Entry(SyncError::WriteInFlight(_))
        ));
        app.settle(QUIET).await;

        let found = app.find_entry("morning", ALICE).unwrap().id.clone();
        assert_eq!(found, entry.id);
        app.remove_entry("morning", &entry.id).await.unwrap();
        assert!(app.entries("morning").is_empty());
        assert_eq!(local_count(&app, "morning"), 0);

        app.settle(QUIET).await;
        assert!(store.list_entries("morning").await.unwrap().is_empty());
        assert_eq!(server_count(&store, "morning").await, 0);
        assert_eq!(local_count(&app, "morning"), 0);

        assert!(matches!(
            app.remove_entry("morning", &entry.id).await.unwrap_err(),
            CheckInError::Entry(SyncError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_event_stats_and_reconcile() {
        let (mut app, store, _dir) = logged_in("admin", "secret").await;
        let opts = CheckInOptions::default();
        app.check_in("lunch", ALICE, None, opts).await.unwrap();
        app.check_in("lunch", BOB, Some("VIP"), opts).await.unwrap();
        app.settle(QUIET).await;

        let stats = app.event_stats("lunch").await.unwrap();
        assert_eq!(stats.actual, 2);
        assert_eq!(stats.counter, 2);
        assert!(!stats.has_drift());
        assert_eq!(stats.by_recorder, vec![("admin".to_string(), 2)]);

        // Counter drifts on the server, e.g. a lost decrement.
        store.adjust_counts("lunch", None, 5).await.unwrap();
        let snapshot = app.reconcile_counts("lunch").await.unwrap();
        assert_eq!(snapshot.current_count, 2);
        assert_eq!(snapshot.groups.get("VIP"), Some(&1));
        assert_eq!(server_count(&store, "lunch").await, 2);
        assert_eq!(local_count(&app, "lunch"), 2);
    }

    #[tokio::test]
    async fn test_reconcile_requires_admin() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        assert!(matches!(
            app.reconcile_counts("morning").await.unwrap_err(),
            CheckInError::Auth(AuthError::Forbidden { required: Role::Admin })
        ));
    }

    #[tokio::test]
    async fn test_event_administration() {
        let (mut app, store, _dir) = logged_in("admin", "secret").await;

        let created = app
            .create_event(NewEvent {
                name: "Workshop".to_string(),
                target_count: 20,
                start: at(15),
                end: at(17),
                groups: vec![("Students".to_string(), 10)],
            })
            .await
            .unwrap();
        assert!(store.get_event(&created.id).await.unwrap().is_some());
        assert!(app.events().get(&created.id).is_some());

        let invalid = app
            .create_event(NewEvent {
                name: "Backwards".to_string(),
                target_count: 0,
                start: at(17),
                end: at(15),
                groups: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(invalid, CheckInError::InvalidEvent(_)));

        let passive = app
            .set_event_status(&created.id, EventStatus::Passive)
            .await
            .unwrap();
        assert_eq!(passive.status, EventStatus::Passive);

        let mut renamed = passive.clone();
        renamed.name = "Workshop II".to_string();
        renamed.current_count = 99;
        let updated = app.update_event(renamed).await.unwrap();
        assert_eq!(updated.name, "Workshop II");
        assert_eq!(updated.current_count, 0);

        app.delete_event(&created.id).await.unwrap();
        assert!(store.get_event(&created.id).await.unwrap().is_none());
        assert!(app.events().get(&created.id).is_none());
    }

    #[tokio::test]
    async fn test_delete_event_refused_with_entries() {
        let (mut app, store, _dir) = logged_in("admin", "secret").await;
        app.check_in("evening", CAROL, None, CheckInOptions::default())
            .await
            .unwrap();
        app.settle(QUIET).await;

        let err = app.delete_event("evening").await.unwrap_err();
        assert!(matches!(err, CheckInError::EventHasEntries { count: 1, .. }));
        assert!(store.get_event("evening").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_staff_cannot_create_events() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let err = app
            .create_event(NewEvent {
                name: "Nope".to_string(),
                target_count: 0,
                start: at(15),
                end: at(16),
                groups: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckInError::Auth(AuthError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn test_user_administration() {
        let (mut app, store, dir) = logged_in("admin", "secret").await;
        app.add_user("desk3", "first", vec![Role::Staff]).await.unwrap();
        assert!(matches!(
            app.add_user("DESK3", "again", vec![Role::Staff]).await.unwrap_err(),
            CheckInError::UserExists(_)
        ));

        // A staff member may change their own password but nobody else's.
        let mut staff = app_with(Arc::clone(&store), &dir);
        staff.login("desk3", "first").await.unwrap();
        staff.set_password("desk3", "second").await.unwrap();
        assert!(matches!(
            staff.set_password("desk1", "hijack").await.unwrap_err(),
            CheckInError::Auth(AuthError::Forbidden { required: Role::Admin })
        ));

        let mut fresh = app_with(Arc::clone(&store), &dir);
        assert!(fresh.login("desk3", "first").await.is_err());
        fresh.login("desk3", "second").await.unwrap();

        app.set_password("desk1", "reset").await.unwrap();
        assert!(fresh.login("desk1", "reset").await.is_ok());
    }

    #[tokio::test]
    async fn test_events_served_from_cache_after_restart() {
        let (mut app, store, dir) = logged_in("desk1", "pw1").await;
        assert_eq!(app.refresh_events().await.unwrap(), 4);
        drop(app);

        let mut restarted = app_with(store, &dir);
        assert!(restarted.load_from_cache());
        assert_eq!(restarted.events().len(), 4);
        assert!(restarted.cache_ages.events.is_some());
    }

    #[tokio::test]
    async fn test_background_event_refresh() {
        let (mut app, store, _dir) = logged_in("viewer", "pw3").await;
        store.insert_event(event("late", 22, 23, 0)).await;
        app.spawn_refresh_events().unwrap();
        assert!(app.next_message(Duration::from_secs(2)).await);
        assert!(app.events().get("late").is_some());
    }

    #[tokio::test]
    async fn test_unsent_check_ins_replayed_after_restart() {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();

        // A previous run recorded a check-in but exited before it was written.
        let unsent = AttendanceEntry::new("morning", person(ALICE, "Alice", None), "desk1", None);
        CacheManager::new(dir.path().to_path_buf())
            .unwrap()
            .save_pending(std::slice::from_ref(&unsent))
            .unwrap();

        let mut app = app_with(Arc::clone(&store), &dir);
        app.login("desk1", "pw1").await.unwrap();
        app.load_from_cache();
        assert_eq!(app.pending_count(), 1);

        assert_eq!(app.flush_pending().unwrap(), 1);
        // Already in flight; not sent twice.
        assert_eq!(app.flush_pending().unwrap(), 0);
        app.settle(QUIET).await;

        assert_eq!(app.pending_count(), 0);
        let stored = store.list_entries("morning").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, unsent.id);

        // Loading the event keeps exactly one visible copy.
        app.watch_event("morning").await.unwrap();
        assert_eq!(app.entries("morning").len(), 1);
        assert_eq!(local_count(&app, "morning"), 1);
        assert_eq!(server_count(&store, "morning").await, 1);
    }

    #[tokio::test]
    async fn test_process_sync_messages_drains_channel() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        app.check_in("evening", ALICE, None, CheckInOptions::default())
            .await
            .unwrap();
        // Let the writer run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.process_sync_messages() >= 1);
        app.settle(QUIET).await;
        assert_eq!(app.in_flight_count(), 0);
    }

    /// Store that lets another desk write right after the first entry
    /// listing is taken.
    struct LateWriteStore {
        inner: Arc<MemoryStore>,
        late: std::sync::Mutex<Option<AttendanceEntry>>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for LateWriteStore {
        async fn list_events(&self) -> StoreResult<Vec<Event>> {
            self.inner.list_events().await
        }

        async fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
            self.inner.get_event(event_id).await
        }

        async fn put_event(&self, event: &Event) -> StoreResult<()> {
            self.inner.put_event(event).await
        }

        async fn delete_event(&self, event_id: &str) -> StoreResult<()> {
            self.inner.delete_event(event_id).await
        }

        async fn list_entries(&self, event_id: &str) -> StoreResult<Vec<AttendanceEntry>> {
            let entries = self.inner.list_entries(event_id).await?;
            let late = {
                let mut slot = self.late.lock().unwrap();
                slot.take()
            };
            if let Some(entry) = late {
                self.inner.put_entry(&entry).await?;
                self.inner
                    .adjust_counts(&entry.event_id, entry.group.as_deref(), 1)
                    .await?;
            }
            Ok(entries)
        }

        async fn put_entry(&self, entry: &AttendanceEntry) -> StoreResult<()> {
            self.inner.put_entry(entry).await
        }

        async fn delete_entry(&self, event_id: &str, entry_id: &str) -> StoreResult<()> {
            self.inner.delete_entry(event_id, entry_id).await
        }

        async fn adjust_counts(&self, event_id: &str, group: Option<&str>, delta: i64) -> StoreResult<()> {
            self.inner.adjust_counts(event_id, group, delta).await
        }

        async fn set_counts(&self, event_id: &str, counts: &CounterSnapshot) -> StoreResult<()> {
            self.inner.set_counts(event_id, counts).await
        }

        async fn changes_since(
            &self,
            event_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> StoreResult<Vec<Change>> {
            self.inner.changes_since(event_id, since).await
        }

        async fn find_person(&self, id_number: &str) -> StoreResult<Option<PersonRecord>> {
            self.inner.find_person(id_number).await
        }

        async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
            self.inner.find_user(username).await
        }

        async fn put_user(&self, user: &User) -> StoreResult<()> {
            self.inner.put_user(user).await
        }

        fn push_channel(&self) -> Option<broadcast::Receiver<Change>> {
            self.inner.push_channel()
        }
    }

    #[tokio::test]
    async fn test_write_right_after_listing_still_merged() {
        let inner = seeded_store().await;
        let late = AttendanceEntry::new("morning", person(BOB, "Bob", None), "desk2", None);
        let store = Arc::new(LateWriteStore {
            inner: Arc::clone(&inner),
            late: std::sync::Mutex::new(Some(late.clone())),
        });
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf()).unwrap();
        let mut app = CheckinApp::new(store, test_config(), cache).with_retry_policy(quick_retry());
        app.login("desk1", "pw1").await.unwrap();

        app.watch_event("morning").await.unwrap();
        app.settle(QUIET).await;
        assert_eq!(app.entries("morning").len(), 1);
        assert_eq!(local_count(&app, "morning"), 1);

        let err = app
            .check_in("morning", BOB, None, CheckInOptions::default())
            .await
            .unwrap_err();
        match err {
            CheckInError::AlreadyCheckedIn { entry_id, .. } => assert_eq!(entry_id, late.id),
            other => panic!("unexpected error: {:?}", other),
        }
        app.settle(QUIET).await;
        assert_eq!(inner.list_entries("morning").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_checks_quota_against_store_counters() {
        let (mut app, store, dir) = logged_in("desk1", "pw1").await;
        store.insert_event(event("small", 15, 16, 1)).await;
        app.refresh_events().await.unwrap();
        drop(app);

        // Another desk fills the event while this one is down.
        let remote = AttendanceEntry::new("small", person(BOB, "Bob", None), "desk2", None);
        store.put_entry(&remote).await.unwrap();
        store.adjust_counts("small", None, 1).await.unwrap();

        let mut restarted = app_with(Arc::clone(&store), &dir);
        assert!(restarted.load_from_cache());
        assert_eq!(local_count(&restarted, "small"), 0);

        let err = restarted
            .check_in("small", ALICE, None, CheckInOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckInError::Quota(QuotaError::QuotaReached { target: 1 })
        ));
        assert_eq!(local_count(&restarted, "small"), 1);

        restarted.settle(QUIET).await;
        assert_eq!(server_count(&store, "small").await, 1);
        assert_eq!(store.list_entries("small").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quota_counts_loaded_entries_when_counter_lags() {
        let (mut app, store, _dir) = logged_in("desk1", "pw1").await;
        store.insert_event(event("small", 15, 16, 1)).await;

        // Entry written, counter update lost.
        let remote = AttendanceEntry::new("small", person(BOB, "Bob", None), "desk2", None);
        store.put_entry(&remote).await.unwrap();

        let err = app
            .check_in("small", ALICE, None, CheckInOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckInError::Quota(QuotaError::QuotaReached { target: 1 })
        ));
    }

    #[tokio::test]
    async fn test_refresh_counts_unsent_check_ins() {
        let store = seeded_store().await;
        let dir = TempDir::new().unwrap();
        let unsent = AttendanceEntry::new("morning", person(ALICE, "Alice", None), "desk1", Some("VIP".to_string()));
        CacheManager::new(dir.path().to_path_buf())
            .unwrap()
            .save_pending(std::slice::from_ref(&unsent))
            .unwrap();

        let mut app = app_with(Arc::clone(&store), &dir);
        app.login("desk1", "pw1").await.unwrap();
        app.load_from_cache();
        app.refresh_events().await.unwrap();
        assert_eq!(local_count(&app, "morning"), 1);
        let vip = |app: &CheckinApp| app.events().get("morning").unwrap().group("VIP").unwrap().current_count;
        assert_eq!(vip(&app), 1);

        assert_eq!(app.flush_pending().unwrap(), 1);
        app.settle(QUIET).await;
        assert_eq!(local_count(&app, "morning"), 1);
        assert_eq!(server_count(&store, "morning").await, 1);

        app.refresh_events().await.unwrap();
        assert_eq!(local_count(&app, "morning"), 1);
        assert_eq!(vip(&app), 1);
    }

    #[tokio::test]
    async fn test_reload_listed_before_confirmation_keeps_check_in() {
        let (mut app, _store, _dir) = logged_in("desk1", "pw1").await;
        let listed_at = Utc::now();
        app.check_in("evening", ALICE, None, CheckInOptions::default())
            .await
            .unwrap();
        app.settle(QUIET).await;
        assert_eq!(app.pending_count(), 0);

        // A reload requested before the write landed does not contain it.
        app.handle_message(SyncMessage::EntriesLoaded {
            event_id: "evening".to_string(),
            entries: vec![],
            listed_at,
        });
        assert_eq!(app.entries("evening").len(), 1);
        assert_eq!(local_count(&app, "evening"), 1);
    }

    #[test]
    fn test_conflict_error_message() {
        let err = CheckInError::Conflict(vec![Conflict {
            event_id: "a".to_string(),
            event_name: "Gala".to_string(),
            entry_id: "x".to_string(),
            recorded_at: at(10) + ChronoDuration::minutes(5),
            recorded_by: "desk1".to_string(),
        }]);
        assert_eq!(
            err.to_string(),
            "Already checked in to an overlapping event: Gala (desk1 at 10:05:00)"
        );
    }
}
