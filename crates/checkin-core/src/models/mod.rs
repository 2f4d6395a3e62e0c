//! Data models for check-in entities.
//!
//! - `Event`, `EventGroup`: events with quotas and denormalized counters
//! - `AttendanceEntry`, `PersonRecord`: scanned attendees
//! - `User`, `Role`: staff accounts and privileges

pub mod attendance;
pub mod event;
pub mod user;

pub use attendance::{mask_id_number, AttendanceEntry, PersonRecord};
pub use event::{
    validate_event, Event, EventGroup, EventSortColumn, EventStatus, EventValidationError,
    NewEvent,
};
pub use user::{has_role, Role, User};
