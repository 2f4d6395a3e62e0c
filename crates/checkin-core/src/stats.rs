//! Quota checks and per-event statistics.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{AttendanceEntry, Event};
use crate::store::CounterSnapshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Event is full ({target} attendees)")]
    QuotaReached { target: u32 },

    #[error("Group {group} is full ({target} attendees)")]
    GroupQuotaReached { group: String, target: u32 },

    #[error("Unknown group: {0}")]
    UnknownGroup(String),
}

/// Whether one more attendee fits in the event and, if given, the group.
pub fn check_quota(event: &Event, group: Option<&str>) -> Result<(), QuotaError> {
    if event.is_full() {
        return Err(QuotaError::QuotaReached {
            target: event.target_count,
        });
    }
    if let Some(name) = group {
        let g = event
            .group(name)
            .ok_or_else(|| QuotaError::UnknownGroup(name.to_string()))?;
        if g.is_full() {
            return Err(QuotaError::GroupQuotaReached {
                group: g.name.clone(),
                target: g.target_count,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub name: String,
    pub target_count: u32,
    pub counter: u32,
    pub actual: u32,
}

impl GroupStats {
    pub fn remaining(&self) -> Option<u32> {
        (self.target_count > 0).then(|| self.target_count.saturating_sub(self.counter))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStats {
    pub event_id: String,
    pub event_name: String,
    pub target_count: u32,
    /// Denormalized counter on the event record.
    pub counter: u32,
    /// Entries actually present.
    pub actual: u32,
    /// `counter - actual`; non-zero means the counters need a recount.
    pub drift: i64,
    pub remaining: Option<u32>,
    pub fill_percent: Option<f64>,
    pub groups: Vec<GroupStats>,
    /// Check-ins per staff member, busiest first.
    pub by_recorder: Vec<(String, u32)>,
}

impl EventStats {
    pub fn compute(event: &Event, entries: &[&AttendanceEntry]) -> Self {
        let actual = entries.len() as u32;

        let groups = event
            .groups
            .iter()
            .map(|g| GroupStats {
                name: g.name.clone(),
                target_count: g.target_count,
                counter: g.current_count,
                actual: entries
                    .iter()
                    .filter(|e| e.group.as_deref() == Some(g.name.as_str()))
                    .count() as u32,
            })
            .collect();

        let mut recorders: BTreeMap<&str, u32> = BTreeMap::new();
        for entry in entries {
            *recorders.entry(entry.recorded_by.as_str()).or_insert(0) += 1;
        }
        let mut by_recorder: Vec<(String, u32)> = recorders
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        by_recorder.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Self {
            event_id: event.id.clone(),
            event_name: event.name.clone(),
            target_count: event.target_count,
            counter: event.current_count,
            actual,
            drift: i64::from(event.current_count) - i64::from(actual),
            remaining: event.remaining(),
            fill_percent: event.fill_percent(),
            groups,
            by_recorder,
        }
    }

    pub fn has_drift(&self) -> bool {
        self.drift != 0 || self.groups.iter().any(|g| g.counter != g.actual)
    }
}

/// Counters recomputed from the entries themselves.
pub fn recount(event: &Event, entries: &[&AttendanceEntry]) -> CounterSnapshot {
    let mut groups: BTreeMap<String, u32> =
        event.groups.iter().map(|g| (g.name.clone(), 0)).collect();
    for entry in entries {
        if let Some(count) = entry.group.as_ref().and_then(|g| groups.get_mut(g)) {
            *count += 1;
        }
    }
    CounterSnapshot {
        current_count: entries.len() as u32,
        groups,
    }
}

/// Copy of `event` whose counters are at least what `entries` account for.
pub fn with_entry_floor(event: &Event, entries: &[&AttendanceEntry]) -> Event {
    let actual = recount(event, entries);
    let mut floored = event.clone();
    floored.current_count = floored.current_count.max(actual.current_count);
    for group in &mut floored.groups {
        let count = actual.groups.get(&group.name).copied().unwrap_or(0);
        group.current_count = group.current_count.max(count);
    }
    floored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventGroup, EventStatus, PersonRecord};
    use chrono::Utc;

    fn event(target: u32, current: u32) -> Event {
        let start = Utc::now();
        Event {
            id: "e1".to_string(),
            name: "Gala".to_string(),
            target_count: target,
            current_count: current,
            start,
            end: start + chrono::Duration::hours(3),
            status: EventStatus::Active,
            groups: vec![EventGroup::new("VIP", 1), EventGroup::new("Press", 0)],
        }
    }

    fn entry(recorded_by: &str, group: Option<&str>) -> AttendanceEntry {
        AttendanceEntry::new(
            "e1",
            PersonRecord {
                id_number: "12345678901".to_string(),
                name: "Emmy".to_string(),
                surname: "Noether".to_string(),
                valid_until: None,
            },
            recorded_by,
            group.map(str::to_string),
        )
    }

    #[test]
    fn test_entry_floor_blocks_lagging_counter() {
        let lagging = event(1, 0);
        let vip = entry("desk2", Some("VIP"));
        assert!(check_quota(&lagging, Some("VIP")).is_ok());

        let floored = with_entry_floor(&lagging, &[&vip]);
        assert_eq!(floored.current_count, 1);
        assert_eq!(floored.group("VIP").unwrap().current_count, 1);
        assert_eq!(
            check_quota(&floored, None),
            Err(QuotaError::QuotaReached { target: 1 })
        );

        // Counters ahead of the entries are kept.
        let ahead = with_entry_floor(&event(10, 4), &[&vip]);
        assert_eq!(ahead.current_count, 4);
    }

    #[test]
    fn test_check_quota() {
        assert!(check_quota(&event(0, 500), None).is_ok());
        assert!(check_quota(&event(10, 9), None).is_ok());
        assert_eq!(
            check_quota(&event(10, 10), None),
            Err(QuotaError::QuotaReached { target: 10 })
        );

        let mut e = event(10, 1);
        e.groups[0].current_count = 1;
        assert_eq!(
            check_quota(&e, Some("VIP")),
            Err(QuotaError::GroupQuotaReached {
                group: "VIP".to_string(),
                target: 1
            })
        );
        // Zero group target is unlimited.
        assert!(check_quota(&e, Some("Press")).is_ok());
        assert_eq!(
            check_quota(&e, Some("Crew")),
            Err(QuotaError::UnknownGroup("Crew".to_string()))
        );
    }

    #[test]
    fn test_compute_stats() {
        let mut e = event(10, 4);
        e.groups[0].current_count = 1;
        let entries = vec![
            entry("desk1", Some("VIP")),
            entry("desk2", None),
            entry("desk1", None),
        ];
        let refs: Vec<&AttendanceEntry> = entries.iter().collect();
        let stats = EventStats::compute(&e, &refs);

        assert_eq!(stats.counter, 4);
        assert_eq!(stats.actual, 3);
        assert_eq!(stats.drift, 1);
        assert!(stats.has_drift());
        assert_eq!(stats.remaining, Some(6));
        assert_eq!(stats.fill_percent, Some(40.0));
        assert_eq!(stats.groups[0].actual, 1);
        assert_eq!(stats.groups[0].remaining(), Some(0));
        assert_eq!(stats.groups[1].remaining(), None);
        assert_eq!(
            stats.by_recorder,
            vec![("desk1".to_string(), 2), ("desk2".to_string(), 1)]
        );
    }

    #[test]
    fn test_recount() {
        let e = event(10, 7);
        let entries = vec![
            entry("desk1", Some("VIP")),
            entry("desk1", Some("Unknown")),
            entry("desk1", None),
        ];
        let refs: Vec<&AttendanceEntry> = entries.iter().collect();
        let snapshot = recount(&e, &refs);
        assert_eq!(snapshot.current_count, 3);
        assert_eq!(snapshot.groups.get("VIP"), Some(&1));
        assert_eq!(snapshot.groups.get("Press"), Some(&0));
        assert!(!snapshot.groups.contains_key("Unknown"));

        let mut fixed = e.clone();
        fixed.current_count = snapshot.current_count;
        fixed.groups[0].current_count = 1;
        assert!(!EventStats::compute(&fixed, &refs).has_drift());
    }
}
