//! Normalizer: provider records -> canonical `ExternalEvent`
//!
//! Pure functions. A record missing an id, title, start time or URL (or
//! carrying an unparseable timestamp or a non-http URL) yields `None`; that is
//! ordinary provider noise, not an error.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::providers::{EventbriteEvent, MeetupEvent, RawRecord, TicketmasterEvent};
use crate::schemas::ExternalEvent;

/// Normalizes one raw record
pub fn normalize(raw: &RawRecord) -> Option<ExternalEvent> {
    let event = match raw {
        RawRecord::Ticketmaster(e) => from_ticketmaster(e),
        RawRecord::Eventbrite(e) => from_eventbrite(e),
        RawRecord::Meetup(e) => from_meetup(e),
    }?;

    // An end before the start is provider garbage; keep the event, lose the end
    let end_time = event.end_time.filter(|end| *end >= event.start_time);
    Some(ExternalEvent { end_time, ..event })
}

/// Normalizes a batch, returning the kept events and how many were dropped
pub fn normalize_batch(source: &str, records: &[RawRecord]) -> (Vec<ExternalEvent>, usize) {
    let events: Vec<ExternalEvent> = records.iter().filter_map(normalize).collect();
    let dropped = records.len() - events.len();

    if dropped > 0 {
        debug!(source, dropped, kept = events.len(), "Dropped incomplete records");
    }

    (events, dropped)
}

fn from_ticketmaster(e: &TicketmasterEvent) -> Option<ExternalEvent> {
    let dates = e.dates.as_ref()?;
    let start_time = parse_timestamp(dates.start.as_ref()?.date_time.as_deref()?)?;
    let end_time = dates
        .end
        .as_ref()
        .and_then(|d| d.date_time.as_deref())
        .and_then(parse_timestamp);

    let venue_name = e
        .embedded
        .as_ref()
        .and_then(|emb| emb.venues.iter().find_map(|v| clean(v.name.as_deref())));

    Some(ExternalEvent {
        external_id: clean(e.id.as_deref())?,
        title: clean(e.name.as_deref())?,
        description: clean(e.info.as_deref()).or_else(|| clean(e.description.as_deref())),
        start_time,
        end_time,
        venue_name,
        external_url: web_url(e.url.as_deref())?,
    })
}

fn from_eventbrite(e: &EventbriteEvent) -> Option<ExternalEvent> {
    let start_time = parse_timestamp(e.start.as_ref()?.utc.as_deref()?)?;
    let end_time = e
        .end
        .as_ref()
        .and_then(|t| t.utc.as_deref())
        .and_then(parse_timestamp);

    Some(ExternalEvent {
        external_id: clean(e.id.as_deref())?,
        title: clean(e.name.as_ref().and_then(|n| n.text.as_deref()))?,
        description: clean(e.description.as_ref().and_then(|d| d.text.as_deref())),
        start_time,
        end_time,
        venue_name: clean(e.venue.as_ref().and_then(|v| v.name.as_deref())),
        external_url: web_url(e.url.as_deref())?,
    })
}

fn from_meetup(e: &MeetupEvent) -> Option<ExternalEvent> {
    let start_time = DateTime::<Utc>::from_timestamp_millis(e.time?)?;
    let end_time = e
        .duration
        .filter(|ms| *ms > 0)
        .and_then(|ms| start_time.checked_add_signed(Duration::milliseconds(ms)));

    Some(ExternalEvent {
        external_id: clean(e.id.as_deref())?,
        title: clean(e.name.as_deref())?,
        description: clean(e.description.as_deref()),
        start_time,
        end_time,
        venue_name: clean(e.venue.as_ref().and_then(|v| v.name.as_deref())),
        external_url: web_url(e.link.as_deref())?,
    })
}

/// Trimmed, non-empty string
fn clean(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Absolute http(s) URL
fn web_url(value: Option<&str>) -> Option<String> {
    let raw = clean(value)?;
    let url = url::Url::parse(&raw).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(raw)
}

/// ISO 8601 timestamp with an offset, or a bare UTC date-time
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
