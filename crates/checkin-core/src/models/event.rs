use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    #[default]
    Active,
    Passive,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Active => write!(f, "ACTIVE"),
            EventStatus::Passive => write!(f, "PASSIVE"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(EventStatus::Active),
            "passive" => Ok(EventStatus::Passive),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// Sub-group of an event with its own quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGroup {
    pub name: String,
    #[serde(default)]
    pub target_count: u32,
    #[serde(default)]
    pub current_count: u32,
}

impl EventGroup {
    pub fn new(name: impl Into<String>, target_count: u32) -> Self {
        Self {
            name: name.into(),
            target_count,
            current_count: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.target_count > 0 && self.current_count >= self.target_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    /// Maximum attendees; 0 means unlimited.
    #[serde(default)]
    pub target_count: u32,
    /// Denormalized attendee counter, maintained by check-ins.
    #[serde(default)]
    pub current_count: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub groups: Vec<EventGroup>,
}

impl Event {
    /// Build a new event from validated input, with a fresh id and zeroed counters.
    pub fn from_new(new: NewEvent) -> Result<Self, EventValidationError> {
        new.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            target_count: new.target_count,
            current_count: 0,
            start: new.start,
            end: new.end,
            status: EventStatus::Active,
            groups: new
                .groups
                .into_iter()
                .map(|(name, target)| EventGroup::new(name.trim(), target))
                .collect(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == EventStatus::Active
    }

    /// Half-open window overlap. Events that merely touch do not overlap,
    /// and an event with an empty window overlaps nothing.
    pub fn overlaps(&self, other: &Event) -> bool {
        if self.end <= self.start || other.end <= other.start {
            return false;
        }
        self.start < other.end && other.start < self.end
    }

    pub fn group(&self, name: &str) -> Option<&EventGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut EventGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    pub fn is_full(&self) -> bool {
        self.target_count > 0 && self.current_count >= self.target_count
    }

    /// Seats left, or `None` when the event is unlimited.
    pub fn remaining(&self) -> Option<u32> {
        if self.target_count == 0 {
            None
        } else {
            Some(self.target_count.saturating_sub(self.current_count))
        }
    }

    pub fn fill_percent(&self) -> Option<f64> {
        if self.target_count == 0 {
            None
        } else {
            Some(f64::from(self.current_count) * 100.0 / f64::from(self.target_count))
        }
    }

    /// Apply a counter delta to the event and, if given, one of its groups.
    /// Counters saturate at zero.
    pub fn apply_count_delta(&mut self, group: Option<&str>, delta: i64) {
        self.current_count = apply_delta(self.current_count, delta);
        if let Some(name) = group {
            if let Some(g) = self.group_mut(name) {
                g.current_count = apply_delta(g.current_count, delta);
            }
        }
    }

    /// "Mar 14, 2026 09:00 - 17:00" style window for list views.
    pub fn formatted_window(&self) -> String {
        if self.start.date_naive() == self.end.date_naive() {
            format!(
                "{} - {}",
                self.start.format("%b %d, %Y %H:%M"),
                self.end.format("%H:%M")
            )
        } else {
            format!(
                "{} - {}",
                self.start.format("%b %d, %Y %H:%M"),
                self.end.format("%b %d, %Y %H:%M")
            )
        }
    }

    pub fn count_summary(&self) -> String {
        match self.target_count {
            0 => format!("{}", self.current_count),
            target => format!("{}/{}", self.current_count, target),
        }
    }
}

fn apply_delta(value: u32, delta: i64) -> u32 {
    let next = i64::from(value) + delta;
    next.clamp(0, i64::from(u32::MAX)) as u32
}

/// Input for creating an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub target_count: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub groups: Vec<(String, u32)>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("Event name must not be empty")]
    EmptyName,

    #[error("Event must end after it starts")]
    InvalidWindow,

    #[error("Group name must not be empty")]
    EmptyGroupName,

    #[error("Duplicate group name: {0}")]
    DuplicateGroup(String),

    #[error("Group quotas ({groups}) exceed the event target ({target})")]
    GroupQuotaExceedsTarget { groups: u64, target: u32 },
}

impl NewEvent {
    pub fn validate(&self) -> Result<(), EventValidationError> {
        validate_fields(
            &self.name,
            self.start,
            self.end,
            self.target_count,
            self.groups.iter().map(|(n, t)| (n.as_str(), *t)),
        )
    }
}

/// Validation shared by event creation and edits.
pub fn validate_event(event: &Event) -> Result<(), EventValidationError> {
    validate_fields(
        &event.name,
        event.start,
        event.end,
        event.target_count,
        event.groups.iter().map(|g| (g.name.as_str(), g.target_count)),
    )
}

fn validate_fields<'a>(
    name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    target_count: u32,
    groups: impl Iterator<Item = (&'a str, u32)>,
) -> Result<(), EventValidationError> {
    if name.trim().is_empty() {
        return Err(EventValidationError::EmptyName);
    }
    if end <= start {
        return Err(EventValidationError::InvalidWindow);
    }

    let mut seen: Vec<&str> = Vec::new();
    let mut group_total: u64 = 0;
    for (group_name, target) in groups {
        let group_name = group_name.trim();
        if group_name.is_empty() {
            return Err(EventValidationError::EmptyGroupName);
        }
        if seen.contains(&group_name) {
            return Err(EventValidationError::DuplicateGroup(group_name.to_string()));
        }
        seen.push(group_name);
        group_total += u64::from(target);
    }

    if target_count > 0 && group_total > u64::from(target_count) {
        return Err(EventValidationError::GroupQuotaExceedsTarget {
            groups: group_total,
            target: target_count,
        });
    }
    Ok(())
}

// Sorting options for the events list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSortColumn {
    Name,
    #[default]
    Start,
    Fill,
}

impl std::str::FromStr for EventSortColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(EventSortColumn::Name),
            "start" | "date" => Ok(EventSortColumn::Start),
            "fill" => Ok(EventSortColumn::Fill),
            other => Err(format!("unknown sort column: {}", other)),
        }
    }
}
