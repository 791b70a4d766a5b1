//! Calendar domain types, provider wire types, and the window ordering
//! policy shared by the store and the engine.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One calendar occurrence, as mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    #[serde(default)]
    pub status: EventStatus,
    pub link: Option<String>,
}

impl Event {
    /// Cancelled events are deletion signals, never cache rows.
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }
}

/// Event time - a specific instant or an all-day date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl EventTime {
    /// The exact instant, if this is a timed event.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            EventTime::DateTime(dt) => Some(*dt),
            EventTime::Date(_) => None,
        }
    }

    /// The calendar date this time falls on.
    pub fn date(&self) -> NaiveDate {
        match self {
            EventTime::DateTime(dt) => dt.date_naive(),
            EventTime::Date(d) => *d,
        }
    }
}

/// Event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl Default for EventStatus {
    fn default() -> Self {
        Self::Confirmed
    }
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Tentative => "tentative",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "tentative" => Self::Tentative,
            "cancelled" => Self::Cancelled,
            _ => Self::Confirmed,
        }
    }
}

/// Per-user synchronization metadata.
///
/// `last_sync_at` only moves forward, and is written before the event batch
/// it describes. `sync_token` is a reserved provider cursor, currently
/// neither populated nor consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetadata {
    pub user_id: String,
    pub last_sync_at: DateTime<Utc>,
    pub sync_token: Option<String>,
}

/// One window of events fetched from the provider.
#[derive(Debug, Clone)]
pub struct EventWindow {
    pub events: Vec<Event>,
    /// Provider-supplied calendar summary (the calendar's display name).
    pub summary: String,
}

/// Window ordering: timed events ascending by instant, then all-day events
/// ascending by date, events with no start last.
pub fn window_order(a: &Event, b: &Event) -> Ordering {
    sort_rank(a).cmp(&sort_rank(b))
}

fn sort_rank(event: &Event) -> (u8, i64) {
    match &event.start {
        Some(EventTime::DateTime(dt)) => (0, dt.timestamp_millis()),
        Some(EventTime::Date(d)) => (1, i64::from(d.num_days_from_ce())),
        None => (2, 0),
    }
}

// API Response Types

/// Provider event payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvent {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<ApiEventTime>,
    pub end: Option<ApiEventTime>,
    pub status: Option<String>,
    pub html_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEventTime {
    pub date_time: Option<String>,
    pub date: Option<String>,
    pub time_zone: Option<String>,
}

/// Provider response for an event list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListResponse {
    #[serde(default)]
    pub items: Vec<ApiEvent>,
    pub summary: Option<String>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

impl Event {
    /// Convert a provider payload to a local Event.
    pub fn from_api(api: ApiEvent) -> Self {
        let status = api
            .status
            .as_deref()
            .map(EventStatus::parse)
            .unwrap_or_default();

        Self {
            id: api.id,
            summary: api.summary,
            description: api.description,
            location: api.location,
            start: api.start.as_ref().and_then(parse_event_time),
            end: api.end.as_ref().and_then(parse_event_time),
            status,
            link: api.html_link,
        }
    }
}

fn parse_event_time(api: &ApiEventTime) -> Option<EventTime> {
    if let Some(dt_str) = &api.date_time {
        if let Ok(dt) = DateTime::parse_from_rfc3339(dt_str) {
            return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
        }
    }
    if let Some(date_str) = &api.date {
        if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
            return Some(EventTime::Date(date));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_event_from_api() {
        let json = r#"{
            "id": "event123",
            "summary": "Team Meeting",
            "description": "Weekly sync",
            "location": "Conference Room A",
            "start": {"dateTime": "2024-02-01T10:00:00Z"},
            "end": {"dateTime": "2024-02-01T11:00:00Z"},
            "status": "confirmed",
            "htmlLink": "https://calendar.google.com/event?id=123"
        }"#;

        let api_event: ApiEvent = serde_json::from_str(json).unwrap();
        let event = Event::from_api(api_event);

        assert_eq!(event.id, "event123");
        assert_eq!(event.summary, Some("Team Meeting".to_string()));
        assert_eq!(event.location, Some("Conference Room A".to_string()));
        assert_eq!(event.status, EventStatus::Confirmed);
        assert!(matches!(event.start, Some(EventTime::DateTime(_))));
    }

    #[test]
    fn test_all_day_event() {
        let json = r#"{
            "id": "event456",
            "summary": "Holiday",
            "start": {"date": "2024-02-01"},
            "end": {"date": "2024-02-02"}
        }"#;

        let api_event: ApiEvent = serde_json::from_str(json).unwrap();
        let event = Event::from_api(api_event);

        assert!(matches!(event.start, Some(EventTime::Date(_))));
        assert_eq!(
            event.start.unwrap().date(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
    }

    #[test]
    fn test_cancelled_event_without_start() {
        // Changed-since fetches return cancelled events as bare markers.
        let json = r#"{"id": "gone", "status": "cancelled"}"#;

        let api_event: ApiEvent = serde_json::from_str(json).unwrap();
        let event = Event::from_api(api_event);

        assert!(event.is_cancelled());
        assert!(event.start.is_none());
    }

    #[test]
    fn test_window_order_timed_before_all_day() {
        let timed = |id: &str, hour: u32| Event {
            id: id.to_string(),
            summary: None,
            description: None,
            location: None,
            start: Some(EventTime::DateTime(
                NaiveDate::from_ymd_opt(2024, 2, 2)
                    .unwrap()
                    .and_hms_opt(hour, 0, 0)
                    .unwrap()
                    .and_utc(),
            )),
            end: None,
            status: EventStatus::Confirmed,
            link: None,
        };
        let all_day = Event {
            id: "d".to_string(),
            summary: None,
            description: None,
            location: None,
            start: Some(EventTime::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap())),
            end: None,
            status: EventStatus::Confirmed,
            link: None,
        };
        let no_start = Event {
            id: "n".to_string(),
            start: None,
            ..all_day.clone()
        };

        let mut events = vec![no_start.clone(), all_day.clone(), timed("b", 12), timed("a", 9)];
        events.sort_by(window_order);

        assert_eq!(events[0].id, "a");
        assert_eq!(events[1].id, "b");
        // All-day sorts after timed even with an earlier date.
        assert_eq!(events[2].id, "d");
        assert!(events[3].start.is_none());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            EventStatus::Confirmed,
            EventStatus::Tentative,
            EventStatus::Cancelled,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), status);
        }
        assert_eq!(EventStatus::parse("unknown"), EventStatus::Confirmed);
    }
}
