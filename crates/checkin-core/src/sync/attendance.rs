//! Per-event attendance cache with optimistic writes.
//!
//! Every entry id is owned by exactly one writer (the device that generated
//! it), so merging is keyed on entry id alone. Local writes are visible
//! immediately and tracked as pending until the store acknowledges them or
//! the listener delivers the server's copy (the "echo"). An entry id moves
//! the counters at most once, however many times it is pushed back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::AttendanceEntry;
use crate::store::{ChangeBatch, ChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Add,
    Remove,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry {0} is still being written")]
    WriteInFlight(String),
}

/// Visible-set changes produced by a merge, used to move counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries that became visible and were not written by us.
    pub added: Vec<AttendanceEntry>,
    /// Entries that stopped being visible.
    pub removed: Vec<AttendanceEntry>,
    /// Server copies of our own pending writes.
    pub echoed: usize,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.echoed == 0
    }

    /// Net counter change for the event and, per group label, for its groups.
    pub fn count_deltas(&self) -> Vec<(Option<String>, i64)> {
        self.added
            .iter()
            .map(|e| (e.group.clone(), 1))
            .chain(self.removed.iter().map(|e| (e.group.clone(), -1)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceCache {
    event_id: String,
    entries: HashMap<String, AttendanceEntry>,
    pending: HashMap<String, PendingOp>,
    /// Operations acknowledged by the store, with the acknowledgement time.
    /// A listing fetched before that time may not reflect them yet.
    settled: HashMap<String, (PendingOp, DateTime<Utc>)>,
    loaded_at: Option<DateTime<Utc>>,
}

impl AttendanceCache {
    pub fn new(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            entries: HashMap::new(),
            pending: HashMap::new(),
            settled: HashMap::new(),
            loaded_at: None,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded_at.is_some()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    fn is_visible(&self, entry_id: &str) -> bool {
        self.entries.contains_key(entry_id) && self.pending.get(entry_id) != Some(&PendingOp::Remove)
    }

    /// Visible entries, oldest first.
    pub fn entries(&self) -> Vec<&AttendanceEntry> {
        let mut visible: Vec<&AttendanceEntry> = self
            .entries
            .values()
            .filter(|e| self.is_visible(&e.id))
            .collect();
        visible.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id)));
        visible
    }

    pub fn len(&self) -> usize {
        self.entries.keys().filter(|id| self.is_visible(id)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, entry_id: &str) -> Option<&AttendanceEntry> {
        self.entries.get(entry_id).filter(|e| self.is_visible(&e.id))
    }

    pub fn find_by_id_number(&self, id_number: &str) -> Option<&AttendanceEntry> {
        self.entries
            .values()
            .filter(|e| self.is_visible(&e.id))
            .find(|e| e.person.id_number == id_number)
    }

    pub fn pending_op(&self, entry_id: &str) -> Option<PendingOp> {
        self.pending.get(entry_id).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Entries written locally but not yet acknowledged.
    pub fn pending_adds(&self) -> Vec<&AttendanceEntry> {
        self.pending
            .iter()
            .filter(|(_, op)| **op == PendingOp::Add)
            .filter_map(|(id, _)| self.entries.get(id))
            .collect()
    }

    /// Optimistically insert a new entry. Returns false if the id is already known.
    pub fn add_pending(&mut self, entry: AttendanceEntry) -> bool {
        if self.entries.contains_key(&entry.id) {
            return false;
        }
        self.pending.insert(entry.id.clone(), PendingOp::Add);
        self.entries.insert(entry.id.clone(), entry);
        true
    }

    /// Optimistically hide an entry until its deletion is acknowledged.
    pub fn remove_pending(&mut self, entry_id: &str) -> Result<AttendanceEntry, SyncError> {
        if !self.is_visible(entry_id) {
            return Err(SyncError::EntryNotFound(entry_id.to_string()));
        }
        if self.pending.get(entry_id) == Some(&PendingOp::Add) {
            return Err(SyncError::WriteInFlight(entry_id.to_string()));
        }
        self.pending.insert(entry_id.to_string(), PendingOp::Remove);
        self.entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| SyncError::EntryNotFound(entry_id.to_string()))
    }

    /// The store acknowledged our write or deletion.
    pub fn confirm_write(&mut self, entry_id: &str) {
        if let Some(op) = self.pending.remove(entry_id) {
            if op == PendingOp::Remove {
                self.entries.remove(entry_id);
            }
            self.settled.insert(entry_id.to_string(), (op, Utc::now()));
        }
    }

    /// Undo a failed optimistic operation. Returns the entry and the op undone.
    pub fn rollback(&mut self, entry_id: &str) -> Option<(AttendanceEntry, PendingOp)> {
        let op = self.pending.remove(entry_id)?;
        match op {
            PendingOp::Add => self.entries.remove(entry_id).map(|e| (e, op)),
            PendingOp::Remove => self.entries.get(entry_id).cloned().map(|e| (e, op)),
        }
    }

    /// Merge a batch of pushed changes.
    pub fn apply_batch(&mut self, batch: &ChangeBatch) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for change in batch.changes.iter().filter(|c| c.event_id == self.event_id) {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let Some(entry) = change.entry.clone() else {
                        continue;
                    };
                    match self.pending.get(&change.entry_id).copied() {
                        Some(PendingOp::Add) => {
                            self.pending.remove(&change.entry_id);
                            self.settled
                                .insert(change.entry_id.clone(), (PendingOp::Add, Utc::now()));
                            self.entries.insert(change.entry_id.clone(), entry);
                            outcome.echoed += 1;
                        }
                        Some(PendingOp::Remove) => {
                            // Still hidden; keep the server copy for a possible rollback.
                            self.entries.insert(change.entry_id.clone(), entry);
                        }
                        None => {
                            if self
                                .entries
                                .insert(change.entry_id.clone(), entry.clone())
                                .is_none()
                            {
                                outcome.added.push(entry);
                            }
                        }
                    }
                }
                ChangeKind::Removed => {
                    self.settled.remove(&change.entry_id);
                    match self.pending.remove(&change.entry_id) {
                        Some(PendingOp::Remove) => {
                            self.entries.remove(&change.entry_id);
                            outcome.echoed += 1;
                        }
                        Some(PendingOp::Add) | None => {
                            if let Some(entry) = self.entries.remove(&change.entry_id) {
                                outcome.removed.push(entry);
                            }
                        }
                    }
                }
            }
        }

        outcome
    }

    /// Replace the confirmed set with a listing taken now.
    pub fn replace_all(&mut self, server_entries: Vec<AttendanceEntry>) -> MergeOutcome {
        self.replace_all_as_of(server_entries, Utc::now())
    }

    /// Replace the confirmed set with a full server listing requested at
    /// `listed_at`, keeping pending operations and operations acknowledged
    /// after `listed_at` that the listing does not yet reflect.
    pub fn replace_all_as_of(
        &mut self,
        server_entries: Vec<AttendanceEntry>,
        listed_at: DateTime<Utc>,
    ) -> MergeOutcome {
        let was_visible: HashMap<String, AttendanceEntry> = self
            .entries
            .values()
            .filter(|e| self.is_visible(&e.id))
            .map(|e| (e.id.clone(), e.clone()))
            .collect();

        let mut next: HashMap<String, AttendanceEntry> = server_entries
            .into_iter()
            .filter(|e| e.event_id == self.event_id)
            .map(|e| (e.id.clone(), e))
            .collect();

        self.settled.retain(|_, (_, at)| *at >= listed_at);
        for (id, (op, _)) in &self.settled {
            match op {
                PendingOp::Add => {
                    if let Some(entry) = self.entries.get(id) {
                        next.entry(id.clone()).or_insert_with(|| entry.clone());
                    }
                }
                PendingOp::Remove => {
                    next.remove(id);
                }
            }
        }

        let mut echoed = 0;
        let mut still_pending = HashMap::new();
        for (id, op) in self.pending.drain() {
            match op {
                PendingOp::Add if next.contains_key(&id) => echoed += 1,
                PendingOp::Add => {
                    if let Some(entry) = self.entries.get(&id) {
                        next.insert(id.clone(), entry.clone());
                        still_pending.insert(id, op);
                    }
                }
                PendingOp::Remove if next.contains_key(&id) => {
                    still_pending.insert(id, op);
                }
                PendingOp::Remove => echoed += 1,
            }
        }
        self.pending = still_pending;
        self.entries = next;
        self.loaded_at = Some(Utc::now());

        let mut outcome = MergeOutcome {
            echoed,
            ..Default::default()
        };
        for entry in self.entries.values().filter(|e| self.is_visible(&e.id)) {
            if !was_visible.contains_key(&entry.id) {
                outcome.added.push(entry.clone());
            }
        }
        for (id, entry) in was_visible {
            if !self.is_visible(&id) {
                outcome.removed.push(entry);
            }
        }
        outcome
    }
}

/// All per-event caches currently held in memory.
#[derive(Debug, Default)]
pub struct AttendanceIndex {
    caches: HashMap<String, AttendanceCache>,
}

impl AttendanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<&AttendanceCache> {
        self.caches.get(event_id)
    }

    pub fn get_mut(&mut self, event_id: &str) -> Option<&mut AttendanceCache> {
        self.caches.get_mut(event_id)
    }

    pub fn get_or_create(&mut self, event_id: &str) -> &mut AttendanceCache {
        self.caches
            .entry(event_id.to_string())
            .or_insert_with(|| AttendanceCache::new(event_id))
    }

    pub fn is_loaded(&self, event_id: &str) -> bool {
        self.caches.get(event_id).map(|c| c.is_loaded()).unwrap_or(false)
    }

    pub fn remove(&mut self, event_id: &str) -> Option<AttendanceCache> {
        self.caches.remove(event_id)
    }

    /// Visible entries for an event; empty when the event is not loaded.
    pub fn entries(&self, event_id: &str) -> Vec<&AttendanceEntry> {
        self.caches
            .get(event_id)
            .map(|c| c.entries())
            .unwrap_or_default()
    }

    pub fn pending_adds(&self) -> Vec<AttendanceEntry> {
        self.caches
            .values()
            .flat_map(|c| c.pending_adds())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.caches.values().map(|c| c.pending_count()).sum()
    }
}
