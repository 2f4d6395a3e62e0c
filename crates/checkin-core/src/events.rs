//! In-memory event list.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::{Event, EventSortColumn};
use crate::utils::{cmp_ignore_case, contains_ignore_case};

#[derive(Debug, Clone, Default)]
pub struct EventList {
    events: Vec<Event>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, events: Vec<Event>) {
        self.events = events;
        self.refreshed_at = Some(Utc::now());
    }

    pub fn upsert(&mut self, event: Event) {
        match self.events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => self.events.push(event),
        }
    }

    pub fn remove(&mut self, event_id: &str) -> Option<Event> {
        let idx = self.events.iter().position(|e| e.id == event_id)?;
        Some(self.events.remove(idx))
    }

    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.id == event_id)
    }

    pub fn all(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    pub fn active(&self) -> Vec<&Event> {
        self.events.iter().filter(|e| e.is_active()).collect()
    }

    /// Case-insensitive substring match on name or id.
    pub fn search(&self, query: &str) -> Vec<&Event> {
        let query = query.trim();
        self.events
            .iter()
            .filter(|e| query.is_empty() || contains_ignore_case(&e.name, query) || e.id == query)
            .collect()
    }

    pub fn sorted(&self, column: EventSortColumn, ascending: bool) -> Vec<&Event> {
        let mut events: Vec<&Event> = self.events.iter().collect();
        events.sort_by(|a, b| {
            let ord = match column {
                EventSortColumn::Name => cmp_ignore_case(&a.name, &b.name),
                EventSortColumn::Start => a.start.cmp(&b.start),
                EventSortColumn::Fill => cmp_fill(a, b),
            };
            let ord = ord.then_with(|| a.id.cmp(&b.id));
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        events
    }

    /// Other events whose windows overlap `event_id`'s.
    pub fn overlapping(&self, event_id: &str) -> Vec<&Event> {
        let Some(target) = self.get(event_id) else {
            return Vec::new();
        };
        self.events
            .iter()
            .filter(|e| e.id != target.id && e.overlaps(target))
            .collect()
    }

    /// Optimistic local counter update. Returns false for an unknown event.
    pub fn apply_count_delta(&mut self, event_id: &str, group: Option<&str>, delta: i64) -> bool {
        match self.events.iter_mut().find(|e| e.id == event_id) {
            Some(event) => {
                event.apply_count_delta(group, delta);
                true
            }
            None => false,
        }
    }
}

// Unlimited events sort after every limited one.
fn cmp_fill(a: &Event, b: &Event) -> Ordering {
    match (a.fill_percent(), b.fill_percent()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
