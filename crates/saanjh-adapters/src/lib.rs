//! Source adapter contracts + per-platform fetch/parse implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use saanjh_core::{EventLocation, RawEvent, SourcePlatform};
use saanjh_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "saanjh-adapters";

/// Event timestamps from Indian listing sites often arrive as naive local
/// time. Those are interpreted as IST.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-run inputs shared by every adapter: which cities and audience
/// keywords to query, how far ahead to look, and how to pace
/// sequential requests.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub cities: Vec<String>,
    pub keywords: Vec<String>,
    pub window_days: u32,
    pub request_delay: Duration,
}

impl FetchContext {
    pub fn keyword_query(&self) -> String {
        self.keywords.join(" ")
    }

    /// End of the search window, for APIs that take a date range.
    pub fn window_end(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(i64::from(self.window_days))
    }

    async fn pace(&self, is_first: bool) {
        if !is_first && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}

/// One external listing platform. Adapters fetch and parse; they never
/// classify, deduplicate, or persist.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> SourcePlatform;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawEvent>, AdapterError>;
}

// ---------------------------------------------------------------------------
// Datetime handling
// ---------------------------------------------------------------------------

/// Parse the datetime shapes the listing platforms actually emit:
/// RFC 3339, naive ISO with or without a `T`, and bare dates. Naive
/// values are read as IST.
pub fn parse_event_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let ist = FixedOffset::east_opt(IST_OFFSET_SECS)?;
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return ist.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return ist.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc));
    }
    None
}

/// Epoch milliseconds, as emitted by Meetup.
pub fn datetime_from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Epoch seconds, as emitted by Paytm Insider.
pub fn datetime_from_epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_i64()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_bool()
}

fn owned_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

// ---------------------------------------------------------------------------
// Meetup
// ---------------------------------------------------------------------------

const MEETUP_SEARCH_URL: &str = "https://api.meetup.com/find/upcoming_events";

pub struct MeetupAdapter {
    api_key: String,
}

impl MeetupAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

/// One Meetup search response page into raw events. Entries without a
/// title or a parseable start time are skipped, never fatal.
pub fn parse_meetup_events(payload: &JsonValue, fallback_city: &str) -> Vec<RawEvent> {
    let Some(items) = payload.get("events").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = owned_str(item, &["name"])?;
            let start_datetime = json_i64(item, &["time"]).and_then(datetime_from_epoch_millis)?;
            let end_datetime = json_i64(item, &["time"])
                .zip(json_i64(item, &["duration"]))
                .and_then(|(start, duration)| datetime_from_epoch_millis(start + duration));
            let is_online = json_bool(item, &["is_online_event"]).unwrap_or(false);
            Some(RawEvent {
                title,
                description: owned_str(item, &["description"]).unwrap_or_default(),
                start_datetime,
                end_datetime,
                location: EventLocation {
                    city: owned_str(item, &["venue", "city"])
                        .or_else(|| Some(fallback_city.to_string())),
                    venue: owned_str(item, &["venue", "name"]),
                    latitude: json_f64(item, &["venue", "lat"]),
                    longitude: json_f64(item, &["venue", "lon"]),
                },
                is_online,
                registration_url: owned_str(item, &["link"]),
                organizer_name: owned_str(item, &["group", "name"]),
                organizer_contact: None,
                external_id: owned_str(item, &["id"]),
                image_url: owned_str(item, &["featured_photo", "photo_link"]),
                source_platform: SourcePlatform::Meetup,
            })
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for MeetupAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Meetup
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let keyword_query = ctx.keyword_query();
        let window_end = ctx.window_end().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut events = Vec::new();
        for (index, city) in ctx.cities.iter().enumerate() {
            ctx.pace(index == 0).await;
            let payload: JsonValue = http
                .get_json(
                    MEETUP_SEARCH_URL,
                    &[
                        ("text", keyword_query.clone()),
                        ("location", city.clone()),
                        ("end_date_range", window_end.clone()),
                        ("order", "time".to_string()),
                    ],
                    Some(&self.api_key),
                )
                .await?;
            let city_events = parse_meetup_events(&payload, city);
            debug!(city = %city, count = city_events.len(), "meetup city page parsed");
            events.extend(city_events);
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Eventbrite
// ---------------------------------------------------------------------------

const EVENTBRITE_SEARCH_URL: &str = "https://www.eventbriteapi.com/v3/events/search/";

pub struct EventbriteAdapter {
    token: String,
}

impl EventbriteAdapter {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

pub fn parse_eventbrite_events(payload: &JsonValue, fallback_city: &str) -> Vec<RawEvent> {
    let Some(items) = payload.get("events").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = owned_str(item, &["name", "text"])?;
            let start_datetime =
                json_str(item, &["start", "local"]).and_then(parse_event_datetime)?;
            let end_datetime = json_str(item, &["end", "local"]).and_then(parse_event_datetime);
            Some(RawEvent {
                title,
                description: owned_str(item, &["description", "text"]).unwrap_or_default(),
                start_datetime,
                end_datetime,
                location: EventLocation {
                    city: owned_str(item, &["venue", "address", "city"])
                        .or_else(|| Some(fallback_city.to_string())),
                    venue: owned_str(item, &["venue", "name"]),
                    latitude: json_str(item, &["venue", "address", "latitude"])
                        .and_then(|s| s.parse().ok()),
                    longitude: json_str(item, &["venue", "address", "longitude"])
                        .and_then(|s| s.parse().ok()),
                },
                is_online: json_bool(item, &["online_event"]).unwrap_or(false),
                registration_url: owned_str(item, &["url"]),
                organizer_name: owned_str(item, &["organizer", "name"]),
                organizer_contact: None,
                external_id: owned_str(item, &["id"]),
                image_url: owned_str(item, &["logo", "url"]),
                source_platform: SourcePlatform::Eventbrite,
            })
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for EventbriteAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Eventbrite
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let keyword_query = ctx.keyword_query();
        let window_end = ctx.window_end().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut events = Vec::new();
        for (index, city) in ctx.cities.iter().enumerate() {
            ctx.pace(index == 0).await;
            let payload: JsonValue = http
                .get_json(
                    EVENTBRITE_SEARCH_URL,
                    &[
                        ("q", keyword_query.clone()),
                        ("location.address", city.clone()),
                        ("start_date.range_end", window_end.clone()),
                        ("expand", "venue,organizer".to_string()),
                    ],
                    Some(&self.token),
                )
                .await?;
            events.extend(parse_eventbrite_events(&payload, city));
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// BookMyShow (HTML)
// ---------------------------------------------------------------------------

const BOOKMYSHOW_BASE_URL: &str = "https://in.bookmyshow.com/explore/events";

pub struct BookmyshowAdapter;

impl BookmyshowAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BookmyshowAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn selector(spec: &str) -> Result<Selector, AdapterError> {
    Selector::parse(spec).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().and_then(|n| {
        let text = n.text().collect::<String>();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn element_attr(element: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Listing cards out of a BookMyShow explore page. Card markup without a
/// title or date is skipped.
pub fn parse_bookmyshow_events(html: &str, city: &str) -> Result<Vec<RawEvent>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.event-card")?;
    let title_sel = selector(".event-title")?;
    let date_sel = selector(".event-date")?;
    let venue_sel = selector(".event-venue")?;
    let desc_sel = selector(".event-description")?;
    let link_sel = selector("a[href]")?;
    let image_sel = selector("img[src]")?;

    let mut events = Vec::new();
    for card in document.select(&card_sel) {
        let Some(title) = element_text(&card, &title_sel) else {
            continue;
        };
        let Some(start_datetime) = element_text(&card, &date_sel)
            .as_deref()
            .and_then(parse_event_datetime)
        else {
            continue;
        };
        let registration_url = element_attr(&card, &link_sel, "href")
            .map(|href| {
                if href.starts_with("http") {
                    href
                } else {
                    format!("https://in.bookmyshow.com{href}")
                }
            });
        let external_id = card.value().attr("data-event-id").map(ToString::to_string);
        events.push(RawEvent {
            title,
            description: element_text(&card, &desc_sel).unwrap_or_default(),
            start_datetime,
            end_datetime: None,
            location: EventLocation {
                city: Some(city.to_string()),
                venue: element_text(&card, &venue_sel),
                latitude: None,
                longitude: None,
            },
            is_online: false,
            registration_url,
            organizer_name: None,
            organizer_contact: None,
            external_id,
            image_url: element_attr(&card, &image_sel, "src"),
            source_platform: SourcePlatform::Bookmyshow,
        });
    }
    Ok(events)
}

#[async_trait]
impl SourceAdapter for BookmyshowAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Bookmyshow
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let mut events = Vec::new();
        for (index, city) in ctx.cities.iter().enumerate() {
            ctx.pace(index == 0).await;
            let url = format!("{BOOKMYSHOW_BASE_URL}-{}", city.to_lowercase());
            match http.get_text(&url, &[]).await {
                Ok(html) => events.extend(parse_bookmyshow_events(&html, city)?),
                // City pages come and go; one missing page is not a
                // source failure.
                Err(FetchError::HttpStatus { status: 404, url }) => {
                    warn!(%url, "bookmyshow city page absent, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Paytm Insider
// ---------------------------------------------------------------------------

const PAYTM_INSIDER_SEARCH_URL: &str = "https://api.insider.in/search";

pub struct PaytmInsiderAdapter {
    api_key: String,
}

impl PaytmInsiderAdapter {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

pub fn parse_paytm_insider_events(payload: &JsonValue, fallback_city: &str) -> Vec<RawEvent> {
    let Some(items) = json_path_array(payload, &["data", "events"]) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = owned_str(item, &["name"])?;
            let start_datetime =
                json_i64(item, &["start_time"]).and_then(datetime_from_epoch_secs)?;
            let end_datetime = json_i64(item, &["end_time"]).and_then(datetime_from_epoch_secs);
            let is_online = json_str(item, &["event_type"])
                .map(|t| t.eq_ignore_ascii_case("online"))
                .unwrap_or(false);
            Some(RawEvent {
                title,
                description: owned_str(item, &["description"]).unwrap_or_default(),
                start_datetime,
                end_datetime,
                location: EventLocation {
                    city: owned_str(item, &["city"]).or_else(|| Some(fallback_city.to_string())),
                    venue: owned_str(item, &["venue", "name"]),
                    latitude: json_f64(item, &["venue", "latitude"]),
                    longitude: json_f64(item, &["venue", "longitude"]),
                },
                is_online,
                registration_url: owned_str(item, &["url"]),
                organizer_name: owned_str(item, &["organizer"]),
                organizer_contact: None,
                external_id: owned_str(item, &["_id"]),
                image_url: owned_str(item, &["image_url"]),
                source_platform: SourcePlatform::PaytmInsider,
            })
        })
        .collect()
}

fn json_path_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_array()
}

#[async_trait]
impl SourceAdapter for PaytmInsiderAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::PaytmInsider
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let keyword_query = ctx.keyword_query();
        let mut events = Vec::new();
        for (index, city) in ctx.cities.iter().enumerate() {
            ctx.pace(index == 0).await;
            let payload: JsonValue = http
                .get_json(
                    PAYTM_INSIDER_SEARCH_URL,
                    &[
                        ("q", keyword_query.clone()),
                        ("city", city.to_lowercase()),
                    ],
                    Some(&self.api_key),
                )
                .await?;
            events.extend(parse_paytm_insider_events(&payload, city));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    #[test]
    fn datetime_parser_accepts_platform_shapes() {
        let rfc = parse_event_datetime("2026-09-12T07:00:00+05:30").unwrap();
        assert_eq!(rfc.hour(), 1);
        assert_eq!(rfc.minute(), 30);

        let naive_t = parse_event_datetime("2026-09-12T07:00:00").unwrap();
        assert_eq!(naive_t, rfc);

        let naive_space = parse_event_datetime("2026-09-12 07:00:00").unwrap();
        assert_eq!(naive_space, rfc);

        let date_only = parse_event_datetime("2026-09-12").unwrap();
        assert_eq!(date_only.hour(), 18);
        assert_eq!(date_only.minute(), 30);

        assert!(parse_event_datetime("next tuesday").is_none());
        assert!(parse_event_datetime("").is_none());
    }

    #[test]
    fn epoch_helpers_agree_on_the_same_instant() {
        let from_millis = datetime_from_epoch_millis(1_788_500_000_000).unwrap();
        let from_secs = datetime_from_epoch_secs(1_788_500_000).unwrap();
        assert_eq!(from_millis, from_secs);
    }

    #[test]
    fn meetup_parser_maps_fields_and_skips_broken_entries() {
        let payload = json!({
            "events": [
                {
                    "id": "mu-301",
                    "name": "Senior Citizens Laughter Club",
                    "description": "Weekly laughter yoga meetup",
                    "time": 1_788_500_000_000i64,
                    "duration": 5_400_000i64,
                    "is_online_event": false,
                    "link": "https://meetup.com/e/mu-301",
                    "group": { "name": "Pune Silvers" },
                    "venue": { "name": "Kamala Nehru Park", "city": "Pune", "lat": 18.5, "lon": 73.8 }
                },
                { "id": "mu-302", "description": "no title" },
                { "id": "mu-303", "name": "No start time" }
            ]
        });
        let events = parse_meetup_events(&payload, "Mumbai");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Senior Citizens Laughter Club");
        assert_eq!(event.location.city.as_deref(), Some("Pune"));
        assert_eq!(event.location.venue.as_deref(), Some("Kamala Nehru Park"));
        assert_eq!(event.external_id.as_deref(), Some("mu-301"));
        assert_eq!(event.source_platform, SourcePlatform::Meetup);
        let duration = event.end_datetime.unwrap() - event.start_datetime;
        assert_eq!(duration.num_minutes(), 90);
    }

    #[test]
    fn meetup_parser_falls_back_to_query_city() {
        let payload = json!({
            "events": [
                {
                    "id": "mu-310",
                    "name": "Online Wellness Talk",
                    "time": 1_788_500_000_000i64,
                    "is_online_event": true
                }
            ]
        });
        let events = parse_meetup_events(&payload, "Delhi");
        assert_eq!(events[0].location.city.as_deref(), Some("Delhi"));
        assert!(events[0].is_online);
    }

    #[test]
    fn eventbrite_parser_reads_nested_fields_and_string_coords() {
        let payload = json!({
            "events": [
                {
                    "id": "eb-9",
                    "name": { "text": "Retirement Planning Workshop" },
                    "description": { "text": "Financial basics for 60+" },
                    "start": { "local": "2026-10-01T10:00:00" },
                    "end": { "local": "2026-10-01T12:30:00" },
                    "online_event": false,
                    "url": "https://eventbrite.com/e/eb-9",
                    "organizer": { "name": "Silver Trust" },
                    "venue": {
                        "name": "Town Hall",
                        "address": { "city": "Chennai", "latitude": "13.08", "longitude": "80.27" }
                    }
                }
            ]
        });
        let events = parse_eventbrite_events(&payload, "Mumbai");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.location.city.as_deref(), Some("Chennai"));
        assert_eq!(event.location.latitude, Some(13.08));
        assert_eq!(event.organizer_name.as_deref(), Some("Silver Trust"));
        assert!(event.end_datetime.unwrap() > event.start_datetime);
        assert_eq!(event.source_platform, SourcePlatform::Eventbrite);
    }

    #[test]
    fn bookmyshow_parser_extracts_cards_and_skips_undated_markup() {
        let html = r#"
            <html><body>
              <div class="event-card" data-event-id="bms-77">
                <h3 class="event-title">Sugam Sangeet Evening</h3>
                <span class="event-date">2026-11-20 18:00</span>
                <span class="event-venue">Shanmukhananda Hall</span>
                <p class="event-description">Classical melodies for senior audiences</p>
                <a href="/events/sugam-sangeet/bms-77">Book</a>
                <img src="https://img.bms.com/bms-77.jpg" />
              </div>
              <div class="event-card">
                <h3 class="event-title">Card Without A Date</h3>
              </div>
            </body></html>
        "#;
        let events = parse_bookmyshow_events(html, "Mumbai").unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Sugam Sangeet Evening");
        assert_eq!(event.external_id.as_deref(), Some("bms-77"));
        assert_eq!(
            event.registration_url.as_deref(),
            Some("https://in.bookmyshow.com/events/sugam-sangeet/bms-77")
        );
        assert_eq!(event.location.venue.as_deref(), Some("Shanmukhananda Hall"));
        assert_eq!(event.location.city.as_deref(), Some("Mumbai"));
        assert_eq!(event.source_platform, SourcePlatform::Bookmyshow);
    }

    #[test]
    fn paytm_insider_parser_reads_epoch_seconds_and_online_flag() {
        let payload = json!({
            "data": {
                "events": [
                    {
                        "_id": "pi-41",
                        "name": "Chair Yoga for Elders",
                        "description": "Gentle guided session",
                        "start_time": 1_788_500_000i64,
                        "end_time": 1_788_503_600i64,
                        "event_type": "online",
                        "url": "https://insider.in/pi-41",
                        "organizer": "Calm Circle",
                        "city": "bangalore"
                    }
                ]
            }
        });
        let events = parse_paytm_insider_events(&payload, "Bangalore");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.is_online);
        assert_eq!(event.external_id.as_deref(), Some("pi-41"));
        assert_eq!(event.location.city.as_deref(), Some("bangalore"));
        assert_eq!(
            (event.end_datetime.unwrap() - event.start_datetime).num_minutes(),
            60
        );
        assert_eq!(event.source_platform, SourcePlatform::PaytmInsider);
    }

    #[test]
    fn empty_payloads_parse_to_no_events() {
        assert!(parse_meetup_events(&json!({}), "Pune").is_empty());
        assert!(parse_eventbrite_events(&json!({"events": []}), "Pune").is_empty());
        assert!(parse_paytm_insider_events(&json!({"data": {}}), "Pune").is_empty());
        assert!(parse_bookmyshow_events("<html></html>", "Pune").unwrap().is_empty());
    }
}
