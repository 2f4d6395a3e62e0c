use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::models::{AttendanceEntry, Event};

/// Event list is considered stale after 15 minutes.
/// Counters and statuses change during a shift, so this is kept short.
pub const EVENTS_STALE_MINUTES: i64 = 15;

/// Entry lists are kept fresh by the listener while an event is open,
/// so the on-disk copy only needs a coarse staleness bound.
const ENTRIES_STALE_MINUTES: i64 = 60;

/// Length of the ChaCha20-Poly1305 nonce prefixed to encrypted files.
const NONCE_LEN: usize = 12;

pub const CACHE_KEY_LEN: usize = 32;

const EVENTS_KEY: &str = "events";
const PENDING_KEY: &str = "pending_writes";

/// Session file shares the cache directory and survives `clear`.
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn is_stale_after(&self, minutes: i64) -> bool {
        self.age_minutes() > minutes
    }
}

/// Local JSON cache, optionally encrypted at rest.
pub struct CacheManager {
    cache_dir: PathBuf,
    cipher: Option<ChaCha20Poly1305>,
}

impl CacheManager {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            cipher: None,
        })
    }

    /// Cache whose files are sealed with the given 32-byte key.
    pub fn with_encryption(cache_dir: PathBuf, key: &[u8; CACHE_KEY_LEN]) -> Result<Self> {
        let mut manager = Self::new(cache_dir)?;
        manager.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(key)));
        Ok(manager)
    }

    pub fn generate_key() -> [u8; CACHE_KEY_LEN] {
        let mut key = [0u8; CACHE_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        if self.cipher.is_some() {
            self.cache_dir.join(format!("{}.json.enc", name))
        } else {
            self.cache_dir.join(format!("{}.json", name))
        }
    }

    fn seal(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext);
        };
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| anyhow!("Failed to encrypt cache data"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(bytes);
        };
        if bytes.len() < NONCE_LEN {
            return Err(anyhow!("Encrypted cache file is truncated"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt cache data (wrong key or corrupt file)"))
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<CachedData<T>>> {
        let path = self.cache_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read cache file: {}", name))?;
        let plaintext = self
            .open(bytes)
            .with_context(|| format!("Failed to open cache file: {}", name))?;

        let cached: CachedData<T> = serde_json::from_slice(&plaintext)
            .with_context(|| format!("Failed to parse cache file: {}", name))?;

        Ok(Some(cached))
    }

    fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let cached = CachedData::new(data);
        let path = self.cache_path(name);
        let contents = serde_json::to_vec_pretty(&cached)?;
        let sealed = self.seal(contents)?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, sealed)
            .with_context(|| format!("Failed to write cache file: {}", name))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace cache file: {}", name))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.cache_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    // ===== Events =====

    pub fn load_events(&self) -> Result<Option<CachedData<Vec<Event>>>> {
        self.load(EVENTS_KEY)
    }

    pub fn save_events(&self, events: &[Event]) -> Result<()> {
        self.save(EVENTS_KEY, &events)
    }

    // ===== Entries per event =====

    fn entries_key(event_id: &str) -> String {
        let safe: String = event_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("entries_{}", safe)
    }

    pub fn load_entries(&self, event_id: &str) -> Result<Option<CachedData<Vec<AttendanceEntry>>>> {
        self.load(&Self::entries_key(event_id))
    }

    pub fn save_entries(&self, event_id: &str, entries: &[AttendanceEntry]) -> Result<()> {
        self.save(&Self::entries_key(event_id), &entries)
    }

    pub fn remove_entries(&self, event_id: &str) -> Result<()> {
        self.remove(&Self::entries_key(event_id))
    }

    // ===== Pending writes =====

    pub fn load_pending(&self) -> Result<Vec<AttendanceEntry>> {
        Ok(self
            .load::<Vec<AttendanceEntry>>(PENDING_KEY)?
            .map(|c| c.data)
            .unwrap_or_default())
    }

    pub fn save_pending(&self, pending: &[AttendanceEntry]) -> Result<()> {
        if pending.is_empty() {
            self.remove(PENDING_KEY)
        } else {
            self.save(PENDING_KEY, &pending)
        }
    }

    // ===== Cache Age Information =====

    pub fn get_cache_ages(&self) -> CacheAges {
        let events = match self.load_events() {
            Ok(Some(cached)) => Some(cached.age_display()),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "Failed to load events cache for age display");
                None
            }
        };
        CacheAges { events }
    }

    /// Event list staleness; missing or unreadable cache counts as stale.
    pub fn events_stale(&self) -> bool {
        match self.load_events() {
            Ok(Some(cached)) => cached.is_stale_after(EVENTS_STALE_MINUTES),
            Ok(None) => true,
            Err(e) => {
                debug!(error = %e, "Failed to load events cache for staleness check");
                true
            }
        }
    }

    pub fn entries_stale(&self, event_id: &str) -> bool {
        match self.load_entries(event_id) {
            Ok(Some(cached)) => cached.is_stale_after(ENTRIES_STALE_MINUTES),
            Ok(None) => true,
            Err(e) => {
                debug!(event_id, error = %e, "Failed to load entries cache for staleness check");
                true
            }
        }
    }

    /// True when the event list or any of the given events' entries is stale.
    pub fn any_stale<'a>(&self, event_ids: impl IntoIterator<Item = &'a str>) -> bool {
        self.events_stale() || event_ids.into_iter().any(|id| self.entries_stale(id))
    }

    /// Delete every cached document.
    pub fn clear(&self) -> Result<()> {
        for dir_entry in std::fs::read_dir(&self.cache_dir)? {
            let path = dir_entry?.path();
            let is_cache_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| (n.ends_with(".json") || n.ends_with(".json.enc")) && n != SESSION_FILE)
                .unwrap_or(false);
            if is_cache_file {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CacheAges {
    pub events: Option<String>,
}

impl CacheAges {
    pub fn events_age(&self) -> String {
        self.events.clone().unwrap_or_else(|| "never".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, PersonRecord};
    use chrono::Duration;

    fn sample_event() -> Event {
        let start = Utc::now();
        Event {
            id: "e1".to_string(),
            name: "Fair".to_string(),
            target_count: 10,
            current_count: 1,
            start,
            end: start + Duration::hours(2),
            status: EventStatus::Active,
            groups: vec![],
        }
    }

    fn sample_entry() -> AttendanceEntry {
        AttendanceEntry::new(
            "e1",
            PersonRecord {
                id_number: "12345678901".to_string(),
                name: "Ada".to_string(),
                surname: "Lovelace".to_string(),
                valid_until: None,
            },
            "desk1",
            None,
        )
    }

    #[test]
    fn test_cached_data_age_display_just_now() {
        let cached = CachedData::new(vec![1, 2, 3]);
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_cached_data_age_display_rounding() {
        let mut cached = CachedData::new(());
        cached.cached_at = Utc::now() - Duration::minutes(95);
        assert_eq!(cached.age_display(), "2h ago");
        cached.cached_at = Utc::now() - Duration::minutes(5);
        assert_eq!(cached.age_display(), "5m ago");
        cached.cached_at = Utc::now() - Duration::hours(25);
        assert_eq!(cached.age_display(), "1d ago");
    }

    #[test]
    fn test_cached_data_is_stale() {
        let fresh = CachedData::new(vec![1]);
        assert!(!fresh.is_stale_after(EVENTS_STALE_MINUTES));

        let mut old = CachedData::new(vec![1]);
        old.cached_at = Utc::now() - Duration::minutes(16);
        assert!(old.is_stale_after(EVENTS_STALE_MINUTES));
    }

    #[test]
    fn test_events_cache_plain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf()).unwrap();
        assert!(cache.events_stale());
        assert!(cache.load_events().unwrap().is_none());

        let event = sample_event();
        cache.save_events(std::slice::from_ref(&event)).unwrap();
        let loaded = cache.load_events().unwrap().unwrap();
        assert_eq!(loaded.data, vec![event]);
        assert!(!cache.events_stale());
        assert_eq!(cache.get_cache_ages().events_age(), "just now");
    }

    #[test]
    fn test_encrypted_cache_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheManager::generate_key();
        let cache = CacheManager::with_encryption(dir.path().to_path_buf(), &key).unwrap();

        let entry = sample_entry();
        cache.save_entries("e1", std::slice::from_ref(&entry)).unwrap();

        let raw = std::fs::read(dir.path().join("entries_e1.json.enc")).unwrap();
        let raw_text = String::from_utf8_lossy(&raw);
        assert!(!raw_text.contains("12345678901"));

        let loaded = cache.load_entries("e1").unwrap().unwrap();
        assert_eq!(loaded.data, vec![entry]);
    }

    #[test]
    fn test_encrypted_cache_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            CacheManager::with_encryption(dir.path().to_path_buf(), &CacheManager::generate_key())
                .unwrap();
        cache.save_entries("e1", &[sample_entry()]).unwrap();

        let other =
            CacheManager::with_encryption(dir.path().to_path_buf(), &CacheManager::generate_key())
                .unwrap();
        assert!(other.load_entries("e1").is_err());
        assert!(other.entries_stale("e1"));
        assert!(other.any_stale(["e1"]));
    }

    #[test]
    fn test_pending_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf()).unwrap();
        assert!(cache.load_pending().unwrap().is_empty());

        cache.save_pending(&[sample_entry()]).unwrap();
        assert_eq!(cache.load_pending().unwrap().len(), 1);

        cache.save_pending(&[]).unwrap();
        assert!(cache.load_pending().unwrap().is_empty());

        cache.save_events(&[sample_event()]).unwrap();
        cache.clear().unwrap();
        assert!(cache.load_events().unwrap().is_none());
    }

    #[test]
    fn test_entries_key_is_filesystem_safe() {
        assert_eq!(CacheManager::entries_key("a/b c"), "entries_a_b_c");
    }
}
