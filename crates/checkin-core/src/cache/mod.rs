//! Local caching module for offline data access.
//!
//! This module provides the `CacheManager`, a read-through layer in front
//! of the document store. Documents are cached as JSON (optionally sealed
//! with ChaCha20-Poly1305, since entries carry national id numbers):
//! - the event list
//! - attendance entries per event
//! - check-ins not yet acknowledged by the store

pub mod manager;

pub use manager::{CacheAges, CacheManager, CachedData, CACHE_KEY_LEN, EVENTS_STALE_MINUTES};
