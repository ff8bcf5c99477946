//! Canonical and stored event shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider-agnostic event produced by the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEvent {
    pub external_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue_name: Option<String>,
    pub external_url: String,
}

/// Persisted event row, identified by `(source, external_event_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: Uuid,
    pub source: String,
    pub external_event_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue_name: Option<String>,
    pub external_url: String,
    pub city: String,
    pub state: String,
    pub is_active: bool,
    pub last_fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Row for the first sighting of an event
    pub fn first_sighting(
        source: &str,
        city: &str,
        state: &str,
        event: &ExternalEvent,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            external_event_id: event.external_id.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            start_time: event.start_time,
            end_time: event.end_time,
            venue_name: event.venue_name.clone(),
            external_url: event.external_url.clone(),
            city: city.to_string(),
            state: state.to_string(),
            is_active: true,
            last_fetched_at: now,
            created_at: now,
        }
    }

    /// Overwrites the mutable fields from a later sighting and reactivates the row
    pub fn refresh(&mut self, city: &str, state: &str, event: &ExternalEvent, now: DateTime<Utc>) {
        self.title = event.title.clone();
        self.description = event.description.clone();
        self.start_time = event.start_time;
        self.end_time = event.end_time;
        self.venue_name = event.venue_name.clone();
        self.external_url = event.external_url.clone();
        self.city = city.to_string();
        self.state = state.to_string();
        self.is_active = true;
        self.last_fetched_at = now;
    }
}
