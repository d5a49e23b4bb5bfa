//! Event store collaborator boundary + retrying HTTP fetch utilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use saanjh_core::{
    EventIngestionLog, IngestionStatus, NewSeniorEvent, SeniorEvent, SeniorEventUpdate,
    SourcePlatform,
};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "saanjh-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("{0}")]
    Rejected(String),
}

/// Canonical events table + append-only ingestion log, as seen by the
/// pipeline. The web/CRUD side of the application owns everything else.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Non-rejected events with a start in the future. This is the
    /// fuzzy-dedup candidate set for cross-batch matching.
    async fn upcoming_events(&self) -> Result<Vec<SeniorEvent>, StoreError>;

    /// Exact identity lookup by `(external_id, source_platform)`.
    async fn find_by_external_id(
        &self,
        external_id: &str,
        platform: SourcePlatform,
    ) -> Result<Option<SeniorEvent>, StoreError>;

    async fn insert_event(&self, event: &NewSeniorEvent) -> Result<Uuid, StoreError>;

    /// Content-only refresh; the update payload carries no moderation
    /// fields.
    async fn update_event(&self, id: Uuid, update: &SeniorEventUpdate) -> Result<(), StoreError>;

    async fn append_ingestion_log(&self, log: &EventIngestionLog) -> Result<(), StoreError>;

    /// Invoke the store-owned purge of events past the retention window.
    /// Returns the number of removed rows.
    async fn cleanup_expired(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgEventStore {
    pool: PgPool,
    retention_days: i32,
}

impl PgEventStore {
    pub fn new(pool: PgPool, retention_days: u32) -> Self {
        Self {
            pool,
            retention_days: retention_days as i32,
        }
    }

    pub async fn connect(database_url: &str, retention_days: u32) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self::new(pool, retention_days))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn event_from_row(row: &PgRow) -> Result<SeniorEvent, StoreError> {
    let category_raw: String = row.try_get("category")?;
    let category = saanjh_core::EventCategory::parse(&category_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown category {category_raw}")))?;
    let platform_raw: String = row.try_get("source_platform")?;
    let source_platform = SourcePlatform::parse(&platform_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown platform {platform_raw}")))?;
    let tags_json: serde_json::Value = row.try_get("tags")?;
    let tags = tags_json
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(SeniorEvent {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category,
        start_datetime: row.try_get("start_datetime")?,
        end_datetime: row.try_get("end_datetime")?,
        city: row.try_get("city")?,
        venue: row.try_get("venue")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        is_online: row.try_get("is_online")?,
        registration_url: row.try_get("registration_url")?,
        organizer_name: row.try_get("organizer_name")?,
        organizer_contact: row.try_get("organizer_contact")?,
        source_platform,
        senior_relevance_score: row.try_get("senior_relevance_score")?,
        verified: row.try_get("verified")?,
        approved: row.try_get("approved")?,
        rejected: row.try_get("rejected")?,
        rejection_reason: row.try_get("rejection_reason")?,
        external_id: row.try_get("external_id")?,
        image_url: row.try_get("image_url")?,
        tags,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, title, description, category, start_datetime, end_datetime, \
     city, venue, latitude, longitude, is_online, registration_url, organizer_name, \
     organizer_contact, source_platform, senior_relevance_score, verified, approved, \
     rejected, rejection_reason, external_id, image_url, tags, created_at, updated_at";

#[async_trait]
impl EventStore for PgEventStore {
    async fn upcoming_events(&self) -> Result<Vec<SeniorEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM senior_events \
             WHERE NOT rejected AND start_datetime >= now() \
             ORDER BY start_datetime"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
        platform: SourcePlatform,
    ) -> Result<Option<SeniorEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM senior_events \
             WHERE external_id = $1 AND source_platform = $2"
        ))
        .bind(external_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert_event(&self, event: &NewSeniorEvent) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO senior_events (
                title, description, category, start_datetime, end_datetime,
                city, venue, latitude, longitude, is_online,
                registration_url, organizer_name, organizer_contact,
                source_platform, senior_relevance_score, approved,
                external_id, image_url, tags
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13,
                $14, $15, $16,
                $17, $18, $19
            )
            RETURNING id
            "#,
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.category.as_str())
        .bind(event.start_datetime)
        .bind(event.end_datetime)
        .bind(&event.city)
        .bind(&event.venue)
        .bind(event.latitude)
        .bind(event.longitude)
        .bind(event.is_online)
        .bind(&event.registration_url)
        .bind(&event.organizer_name)
        .bind(&event.organizer_contact)
        .bind(event.source_platform.as_str())
        .bind(event.senior_relevance_score)
        .bind(event.approved)
        .bind(&event.external_id)
        .bind(&event.image_url)
        .bind(serde_json::json!(event.tags))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn update_event(&self, id: Uuid, update: &SeniorEventUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE senior_events
               SET title = $2,
                   description = $3,
                   category = $4,
                   start_datetime = $5,
                   end_datetime = $6,
                   senior_relevance_score = $7,
                   tags = $8,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.title)
        .bind(&update.description)
        .bind(update.category.as_str())
        .bind(update.start_datetime)
        .bind(update.end_datetime)
        .bind(update.senior_relevance_score)
        .bind(serde_json::json!(update.tags))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_ingestion_log(&self, log: &EventIngestionLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_ingestion_logs (
                source_platform, status, events_fetched, events_processed,
                events_inserted, events_updated, events_rejected,
                error_message, execution_time_ms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(log.source_platform.as_str())
        .bind(log.status.as_str())
        .bind(log.events_fetched as i64)
        .bind(log.events_processed as i64)
        .bind(log.events_inserted as i64)
        .bind(log.events_updated as i64)
        .bind(log.events_rejected as i64)
        .bind(&log.error_message)
        .bind(log.execution_time_ms as i64)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT cleanup_expired_events($1) AS removed")
            .bind(self.retention_days)
            .fetch_one(&self.pool)
            .await?;
        let removed: i64 = row.try_get("removed")?;
        Ok(removed.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, dry runs)
// ---------------------------------------------------------------------------

/// Store double backed by in-process Vecs. Mirrors the Postgres semantics
/// the pipeline relies on, including the unique external-id constraint.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<SeniorEvent>>,
    logs: Mutex<Vec<EventIngestionLog>>,
    retention: Mutex<chrono::Duration>,
    fail_inserts: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            retention: Mutex::new(chrono::Duration::days(7)),
            fail_inserts: AtomicBool::new(false),
        }
    }

    /// Make subsequent inserts fail, to exercise per-row persistence
    /// error handling.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn seed(&self, event: SeniorEvent) {
        self.events.lock().await.push(event);
    }

    pub async fn all_events(&self) -> Vec<SeniorEvent> {
        self.events.lock().await.clone()
    }

    pub async fn logs(&self) -> Vec<EventIngestionLog> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upcoming_events(&self) -> Result<Vec<SeniorEvent>, StoreError> {
        let now = Utc::now();
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| !e.rejected && e.start_datetime >= now)
            .cloned()
            .collect())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
        platform: SourcePlatform,
    ) -> Result<Option<SeniorEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .find(|e| {
                e.source_platform == platform && e.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn insert_event(&self, event: &NewSeniorEvent) -> Result<Uuid, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("insert refused by store".into()));
        }
        let mut events = self.events.lock().await;
        if let Some(external_id) = &event.external_id {
            let collision = events.iter().any(|e| {
                e.source_platform == event.source_platform
                    && e.external_id.as_deref() == Some(external_id.as_str())
            });
            if collision {
                return Err(StoreError::Rejected(format!(
                    "duplicate external id {external_id} for {}",
                    event.source_platform
                )));
            }
        }
        let now = Utc::now();
        let id = Uuid::new_v4();
        events.push(SeniorEvent {
            id,
            title: event.title.clone(),
            description: event.description.clone(),
            category: event.category,
            start_datetime: event.start_datetime,
            end_datetime: event.end_datetime,
            city: event.city.clone(),
            venue: event.venue.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            is_online: event.is_online,
            registration_url: event.registration_url.clone(),
            organizer_name: event.organizer_name.clone(),
            organizer_contact: event.organizer_contact.clone(),
            source_platform: event.source_platform,
            senior_relevance_score: event.senior_relevance_score,
            verified: false,
            approved: event.approved,
            rejected: false,
            rejection_reason: None,
            external_id: event.external_id.clone(),
            image_url: event.image_url.clone(),
            tags: event.tags.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn update_event(&self, id: Uuid, update: &SeniorEventUpdate) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        event.title = update.title.clone();
        event.description = update.description.clone();
        event.category = update.category;
        event.start_datetime = update.start_datetime;
        event.end_datetime = update.end_datetime;
        event.senior_relevance_score = update.senior_relevance_score;
        event.tags = update.tags.clone();
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn append_ingestion_log(&self, log: &EventIngestionLog) -> Result<(), StoreError> {
        self.logs.lock().await.push(log.clone());
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - *self.retention.lock().await;
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|e| e.start_datetime >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

/// Build a `failed` log row for a source whose fetch never produced events.
pub fn failed_ingestion_log(
    platform: SourcePlatform,
    error: impl std::fmt::Display,
    execution_time_ms: u64,
) -> EventIngestionLog {
    EventIngestionLog {
        source_platform: platform,
        status: IngestionStatus::Failed,
        events_fetched: 0,
        events_processed: 0,
        events_inserted: 0,
        events_updated: 0,
        events_rejected: 0,
        error_message: Some(error.to_string()),
        execution_time_ms,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared GET client with capped exponential retry on 429/5xx and
/// transport errors. Ingestion runs are sequential, so pacing between
/// requests is the caller's job (fixed inter-request delays).
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url).query(query);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, FetchError> {
        let bytes = self.get_bytes(url, query, None).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let bytes = self.get_bytes(url, query, bearer).await?;
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use saanjh_core::{EventCategory, EventClassification, EventLocation, RawEvent};

    fn raw(title: &str, external_id: Option<&str>) -> RawEvent {
        RawEvent {
            title: title.into(),
            description: "desc".into(),
            start_datetime: Utc::now() + ChronoDuration::days(3),
            end_datetime: None,
            location: EventLocation::city("Pune"),
            is_online: false,
            registration_url: None,
            organizer_name: None,
            organizer_contact: None,
            external_id: external_id.map(Into::into),
            image_url: None,
            source_platform: SourcePlatform::Meetup,
        }
    }

    fn classification() -> EventClassification {
        EventClassification::new(
            EventCategory::SocialCommunity,
            0.6,
            vec![],
            "Pune".into(),
            None,
        )
    }

    #[tokio::test]
    async fn memory_store_enforces_external_identity() {
        let store = MemoryEventStore::new();
        let event = NewSeniorEvent::from_classified(&raw("Satsang", Some("m-1")), &classification(), false);
        store.insert_event(&event).await.unwrap();
        let err = store.insert_event(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn memory_store_upcoming_excludes_past_and_rejected() {
        let store = MemoryEventStore::new();
        let future = NewSeniorEvent::from_classified(&raw("Walk", None), &classification(), true);
        let id = store.insert_event(&future).await.unwrap();

        let mut past = future.clone();
        past.title = "Old Walk".into();
        past.start_datetime = Utc::now() - ChronoDuration::days(2);
        store.insert_event(&past).await.unwrap();

        let upcoming = store.upcoming_events().await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, id);
    }

    #[tokio::test]
    async fn memory_store_update_keeps_moderation_flags() {
        let store = MemoryEventStore::new();
        let event = NewSeniorEvent::from_classified(&raw("Bhajan", Some("m-2")), &classification(), true);
        let id = store.insert_event(&event).await.unwrap();

        let update = SeniorEventUpdate {
            title: "Bhajan Evening".into(),
            description: "updated".into(),
            category: EventCategory::Spiritual,
            start_datetime: Utc.with_ymd_and_hms(2027, 1, 5, 17, 0, 0).single().unwrap(),
            end_datetime: None,
            senior_relevance_score: 0.9,
            tags: vec!["bhajan".into()],
        };
        store.update_event(id, &update).await.unwrap();

        let stored = store.all_events().await;
        assert_eq!(stored[0].title, "Bhajan Evening");
        assert!(stored[0].approved, "update must not clear approval");
        assert!(!stored[0].rejected);
    }

    #[tokio::test]
    async fn memory_store_cleanup_removes_expired() {
        let store = MemoryEventStore::new();
        let mut stale = NewSeniorEvent::from_classified(&raw("Expired", None), &classification(), true);
        stale.start_datetime = Utc::now() - ChronoDuration::days(30);
        store.insert_event(&stale).await.unwrap();
        let fresh = NewSeniorEvent::from_classified(&raw("Fresh", None), &classification(), true);
        store.insert_event(&fresh).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.all_events().await.len(), 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_matches_rate_limit_policy() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
