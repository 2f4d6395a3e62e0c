//! Duplicate and cross-event conflict detection.
//!
//! A conflict is the same person checked in to two events whose time
//! windows overlap. Everything here works on already loaded caches and
//! never touches the store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{AttendanceEntry, Event};
use crate::sync::AttendanceIndex;

/// An existing check-in that clashes with a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub event_id: String,
    pub event_name: String,
    pub entry_id: String,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: String,
}

impl Conflict {
    fn from_entry(event: &Event, entry: &AttendanceEntry) -> Self {
        Self {
            event_id: event.id.clone(),
            event_name: event.name.clone(),
            entry_id: entry.id.clone(),
            recorded_at: entry.recorded_at,
            recorded_by: entry.recorded_by.clone(),
        }
    }
}

/// One person found in two overlapping events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub id_number: String,
    pub person_name: String,
    pub first: Conflict,
    pub second: Conflict,
}

pub fn find_duplicate<'a, I>(entries: I, id_number: &str) -> Option<&'a AttendanceEntry>
where
    I: IntoIterator<Item = &'a AttendanceEntry>,
{
    entries.into_iter().find(|e| e.id_number() == id_number)
}

/// Check-ins of `id_number` in loaded events overlapping `target`.
pub fn find_conflicts(
    target: &Event,
    events: &[Event],
    index: &AttendanceIndex,
    id_number: &str,
) -> Vec<Conflict> {
    events
        .iter()
        .filter(|e| e.id != target.id && e.overlaps(target))
        .filter_map(|other| {
            let cache = index.get(&other.id)?;
            let entry = cache.find_by_id_number(id_number)?;
            Some(Conflict::from_entry(other, entry))
        })
        .collect()
}

/// Every person appearing in two overlapping loaded events.
///
/// Each event pair is reported once, ordered by id number and then by the
/// pair's event ids.
pub fn scan_conflicts(events: &[Event], index: &AttendanceIndex) -> Vec<ConflictReport> {
    let loaded: Vec<&Event> = events.iter().filter(|e| index.is_loaded(&e.id)).collect();
    let mut reports = Vec::new();

    for (i, first) in loaded.iter().enumerate() {
        let by_id: HashMap<&str, &AttendanceEntry> = index
            .entries(&first.id)
            .into_iter()
            .map(|e| (e.id_number(), e))
            .collect();
        if by_id.is_empty() {
            continue;
        }

        for second in loaded.iter().skip(i + 1) {
            if !first.overlaps(second) {
                continue;
            }
            for entry in index.entries(&second.id) {
                if let Some(earlier) = by_id.get(entry.id_number()) {
                    let (a, ea, b, eb) = if first.id <= second.id {
                        (*first, *earlier, *second, entry)
                    } else {
                        (*second, entry, *first, *earlier)
                    };
                    reports.push(ConflictReport {
                        id_number: entry.id_number().to_string(),
                        person_name: entry.person.full_name(),
                        first: Conflict::from_entry(a, ea),
                        second: Conflict::from_entry(b, eb),
                    });
                }
            }
        }
    }

    reports.sort_by(|a, b| {
        a.id_number
            .cmp(&b.id_number)
            .then_with(|| a.first.event_id.cmp(&b.first.event_id))
            .then_with(|| a.second.event_id.cmp(&b.second.event_id))
    });
    reports
}
