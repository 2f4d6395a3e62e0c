//! Checkin Core - shared library for the event check-in admin tool.
//!
//! Staff scan national id numbers against per-event quotas. Check-ins are
//! applied optimistically, written to a remote document store in the
//! background, and merged with changes pushed from other desks.

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod events;
pub mod models;
pub mod stats;
pub mod store;
pub mod sync;
pub mod utils;

pub use app::{open_cache, CheckInError, CheckInOptions, CheckinApp};
pub use config::Config;
