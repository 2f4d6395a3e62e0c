//! REST client for the hosted document store.
//!
//! Documents live under a single base URL:
//!
//! - `events`, `events/{id}`, `events/{id}/counters`
//! - `events/{id}/entries`, `events/{id}/entries/{entry_id}`, `events/{id}/changes`
//! - `persons/{id_number}`, `users`, `users/{id}`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{Change, CounterSnapshot, DocumentStore, StoreError, StoreResult};
use crate::models::{AttendanceEntry, Event, PersonRecord, User};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Serialize)]
struct CounterDelta<'a> {
    group: Option<&'a str>,
    delta: i64,
}

/// Document store client over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    /// Clone sharing the connection pool, with a different token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.into()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn auth_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            match header::HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(e) => warn!(error = %e, "Store token is not a valid header value"),
            }
        }
        headers
    }

    /// Send a request, retrying on 429 with exponential backoff.
    /// Returns `Ok(None)` for 404 so single-document reads can map it to "absent".
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> StoreResult<Option<reqwest::Response>> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(self.auth_headers());
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(Some(response));
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(StoreError::RateLimited);
                }
                warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::from_status(status, &body));
        }
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Option<T>> {
        let url = self.url(path);
        match self.send::<()>(Method::GET, &url, None).await? {
            Some(response) => {
                let text = response.text().await?;
                let parsed = serde_json::from_str(&text).map_err(|e| {
                    StoreError::InvalidResponse(format!("Failed to parse {}: {}", path, e))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> StoreResult<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    /// Write without a response body. 404 becomes `NotFound`.
    async fn write<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> StoreResult<()> {
        let url = self.url(path);
        match self.send(method, &url, body).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    fn changes_path(event_id: &str, since: Option<DateTime<Utc>>) -> String {
        match since {
            Some(ts) => format!(
                "events/{}/changes?since={}",
                event_id,
                ts.to_rfc3339_opts(SecondsFormat::Micros, true).replace('+', "%2B")
            ),
            None => format!("events/{}/changes", event_id),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn list_events(&self) -> StoreResult<Vec<Event>> {
        let events: Vec<Event> = self.get("events").await?;
        debug!(count = events.len(), "Events fetched");
        Ok(events)
    }

    async fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        self.get_optional(&format!("events/{}", event_id)).await
    }

    async fn put_event(&self, event: &Event) -> StoreResult<()> {
        self.write(Method::PUT, &format!("events/{}", event.id), Some(event))
            .await
    }

    async fn delete_event(&self, event_id: &str) -> StoreResult<()> {
        self.write::<()>(Method::DELETE, &format!("events/{}", event_id), None)
            .await
    }

    async fn list_entries(&self, event_id: &str) -> StoreResult<Vec<AttendanceEntry>> {
        let entries: Vec<AttendanceEntry> = self
            .get_optional(&format!("events/{}/entries", event_id))
            .await?
            .unwrap_or_default();
        debug!(event_id, count = entries.len(), "Entries fetched");
        Ok(entries)
    }

    async fn put_entry(&self, entry: &AttendanceEntry) -> StoreResult<()> {
        self.write(
            Method::PUT,
            &format!("events/{}/entries/{}", entry.event_id, entry.id),
            Some(entry),
        )
        .await
    }

    async fn delete_entry(&self, event_id: &str, entry_id: &str) -> StoreResult<()> {
        let url = self.url(&format!("events/{}/entries/{}", event_id, entry_id));
        // Deleting an entry that is already gone is not an error.
        self.send::<()>(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn adjust_counts(
        &self,
        event_id: &str,
        group: Option<&str>,
        delta: i64,
    ) -> StoreResult<()> {
        self.write(
            Method::POST,
            &format!("events/{}/counters", event_id),
            Some(&CounterDelta { group, delta }),
        )
        .await
    }

    async fn set_counts(&self, event_id: &str, counts: &CounterSnapshot) -> StoreResult<()> {
        self.write(Method::PUT, &format!("events/{}/counters", event_id), Some(counts))
            .await
    }

    async fn changes_since(
        &self,
        event_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Change>> {
        let changes: Vec<Change> = self
            .get_optional(&Self::changes_path(event_id, since))
            .await?
            .unwrap_or_default();
        Ok(changes)
    }

    async fn find_person(&self, id_number: &str) -> StoreResult<Option<PersonRecord>> {
        self.get_optional(&format!("persons/{}", id_number)).await
    }

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        let users: Vec<User> = self
            .get_optional(&format!("users?username={}", username.to_lowercase()))
            .await?
            .unwrap_or_default();
        Ok(users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username)))
    }

    async fn put_user(&self, user: &User) -> StoreResult<()> {
        self.write(Method::PUT, &format!("users/{}", user.id), Some(user))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use chrono::TimeZone;

    #[test]
    fn test_base_url_trailing_slash() {
        let store = HttpStore::new("https://store.example.org/v1/").unwrap();
        assert_eq!(store.url("events"), "https://store.example.org/v1/events");
    }

    #[test]
    fn test_changes_path() {
        assert_eq!(HttpStore::changes_path("e1", None), "events/e1/changes");
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        assert_eq!(
            HttpStore::changes_path("e1", Some(ts)),
            "events/e1/changes?since=2026-03-14T09:30:00.000000Z"
        );
    }

    #[test]
    fn test_auth_headers() {
        let store = HttpStore::new("https://store.example.org").unwrap();
        assert!(store.auth_headers().get(header::AUTHORIZATION).is_none());

        let authed = store.with_token("abc");
        assert_eq!(
            authed.auth_headers().get(header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_parse_change_feed() {
        let json = r#"[{"kind":"REMOVED","eventId":"e1","entryId":"x1","at":"2026-03-14T09:30:00Z"}]"#;
        let changes: Vec<Change> = serde_json::from_str(json).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert!(changes[0].entry.is_none());
    }
}
