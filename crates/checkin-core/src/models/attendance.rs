use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Person record looked up from the registry by id number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    pub id_number: String,
    pub name: String,
    pub surname: String,
    /// Last day the record is valid; `None` means no expiry.
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
}

impl PersonRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.name, self.surname)
    }

    pub fn display_name(&self) -> String {
        format!("{}, {}", self.surname, self.name)
    }

    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_until.map(|until| date <= until).unwrap_or(true)
    }

    /// Id number with all but the last four digits masked, for logs and listings.
    pub fn masked_id_number(&self) -> String {
        mask_id_number(&self.id_number)
    }
}

pub fn mask_id_number(id_number: &str) -> String {
    let len = id_number.chars().count();
    if len <= 4 {
        return id_number.to_string();
    }
    let visible: String = id_number.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), visible)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    /// Client-generated, so server echoes of optimistic writes can be matched.
    pub id: String,
    pub event_id: String,
    pub person: PersonRecord,
    pub recorded_by: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub group: Option<String>,
}

impl AttendanceEntry {
    pub fn new(
        event_id: &str,
        person: PersonRecord,
        recorded_by: &str,
        group: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            person,
            recorded_by: recorded_by.to_string(),
            recorded_at: Utc::now(),
            group,
        }
    }

    pub fn id_number(&self) -> &str {
        &self.person.id_number
    }

    pub fn formatted_time(&self) -> String {
        self.recorded_at.format("%b %d %H:%M:%S").to_string()
    }
}
