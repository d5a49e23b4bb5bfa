//! Core domain model for the Saanjh event ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "saanjh-core";

/// External listing platform an event was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePlatform {
    Meetup,
    Eventbrite,
    Bookmyshow,
    PaytmInsider,
    Manual,
}

impl SourcePlatform {
    /// Stable wire/storage name for the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Meetup => "meetup",
            SourcePlatform::Eventbrite => "eventbrite",
            SourcePlatform::Bookmyshow => "bookmyshow",
            SourcePlatform::PaytmInsider => "paytm_insider",
            SourcePlatform::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "meetup" => Some(SourcePlatform::Meetup),
            "eventbrite" => Some(SourcePlatform::Eventbrite),
            "bookmyshow" => Some(SourcePlatform::Bookmyshow),
            "paytm_insider" => Some(SourcePlatform::PaytmInsider),
            "manual" => Some(SourcePlatform::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourcePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed category set for senior-audience events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    HealthWellness,
    Spiritual,
    SocialCommunity,
    Learning,
    Fitness,
    OnlineEvents,
    ArtsCulture,
    Entertainment,
}

impl EventCategory {
    pub const ALL: [EventCategory; 8] = [
        EventCategory::HealthWellness,
        EventCategory::Spiritual,
        EventCategory::SocialCommunity,
        EventCategory::Learning,
        EventCategory::Fitness,
        EventCategory::OnlineEvents,
        EventCategory::ArtsCulture,
        EventCategory::Entertainment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::HealthWellness => "health_wellness",
            EventCategory::Spiritual => "spiritual",
            EventCategory::SocialCommunity => "social_community",
            EventCategory::Learning => "learning",
            EventCategory::Fitness => "fitness",
            EventCategory::OnlineEvents => "online_events",
            EventCategory::ArtsCulture => "arts_culture",
            EventCategory::Entertainment => "entertainment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == value)
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common location shape shared by raw and persisted events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub city: Option<String>,
    pub venue: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl EventLocation {
    pub fn city(city: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            ..Self::default()
        }
    }
}

/// Unprocessed event as returned by a source adapter. Lives for one
/// ingestion run and is never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub title: String,
    pub description: String,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: EventLocation,
    pub is_online: bool,
    pub registration_url: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_contact: Option<String>,
    /// Source-scoped stable identifier, when the platform provides one.
    pub external_id: Option<String>,
    pub image_url: Option<String>,
    pub source_platform: SourcePlatform,
}

/// One classification judgment for one raw event in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventClassification {
    pub category: EventCategory,
    pub senior_relevance_score: f64,
    pub tags: Vec<String>,
    pub normalized_city: String,
    pub reasoning: Option<String>,
}

impl EventClassification {
    pub const MAX_TAGS: usize = 5;

    /// Build a classification with the score clamped to [0, 1] and tags
    /// capped at [`Self::MAX_TAGS`].
    pub fn new(
        category: EventCategory,
        senior_relevance_score: f64,
        mut tags: Vec<String>,
        normalized_city: String,
        reasoning: Option<String>,
    ) -> Self {
        tags.truncate(Self::MAX_TAGS);
        Self {
            category,
            senior_relevance_score: clamp_score(senior_relevance_score),
            tags,
            normalized_city,
            reasoning,
        }
    }
}

/// Clamp a relevance score to the valid [0, 1] range. NaN maps to 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Persistent event record, the unit of storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeniorEvent {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: EventCategory,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub venue: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_online: bool,
    pub registration_url: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_contact: Option<String>,
    pub source_platform: SourcePlatform,
    pub senior_relevance_score: f64,
    pub verified: bool,
    pub approved: bool,
    pub rejected: bool,
    pub rejection_reason: Option<String>,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for inserting a new [`SeniorEvent`]; the store assigns
/// identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSeniorEvent {
    pub title: String,
    pub description: String,
    pub category: EventCategory,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub venue: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_online: bool,
    pub registration_url: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_contact: Option<String>,
    pub source_platform: SourcePlatform,
    pub senior_relevance_score: f64,
    pub approved: bool,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
}

impl NewSeniorEvent {
    /// Assemble an insert payload from a raw event and its classification.
    /// The relevance score is clamped; approval is decided by the caller.
    pub fn from_classified(raw: &RawEvent, class: &EventClassification, approved: bool) -> Self {
        Self {
            title: raw.title.clone(),
            description: raw.description.clone(),
            category: class.category,
            start_datetime: raw.start_datetime,
            end_datetime: raw.end_datetime,
            city: Some(class.normalized_city.clone()),
            venue: raw.location.venue.clone(),
            latitude: raw.location.latitude,
            longitude: raw.location.longitude,
            is_online: raw.is_online,
            registration_url: raw.registration_url.clone(),
            organizer_name: raw.organizer_name.clone(),
            organizer_contact: raw.organizer_contact.clone(),
            source_platform: raw.source_platform,
            senior_relevance_score: clamp_score(class.senior_relevance_score),
            approved,
            external_id: raw.external_id.clone(),
            image_url: raw.image_url.clone(),
            tags: class.tags.clone(),
        }
    }
}

/// Content-only refresh applied when a later run sees the same
/// `(external_id, source_platform)` with changed fields. Moderation
/// flags (verified/approved/rejected) are never part of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeniorEventUpdate {
    pub title: String,
    pub description: String,
    pub category: EventCategory,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub senior_relevance_score: f64,
    pub tags: Vec<String>,
}

impl SeniorEventUpdate {
    pub fn from_classified(raw: &RawEvent, class: &EventClassification) -> Self {
        Self {
            title: raw.title.clone(),
            description: raw.description.clone(),
            category: class.category,
            start_datetime: raw.start_datetime,
            end_datetime: raw.end_datetime,
            senior_relevance_score: clamp_score(class.senior_relevance_score),
            tags: class.tags.clone(),
        }
    }
}

/// Outcome of one source within one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Success,
    Partial,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Success => "success",
            IngestionStatus::Partial => "partial",
            IngestionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(IngestionStatus::Success),
            "partial" => Some(IngestionStatus::Partial),
            "failed" => Some(IngestionStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only audit row: one per (run, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventIngestionLog {
    pub source_platform: SourcePlatform,
    pub status: IngestionStatus,
    pub events_fetched: u64,
    pub events_processed: u64,
    pub events_inserted: u64,
    pub events_updated: u64,
    pub events_rejected: u64,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}
