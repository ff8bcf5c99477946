//! In-memory backend for tests and the `fetch` command
//!
//! A single map keyed by `(source, external_event_id)` gives the same
//! uniqueness guarantee as the Postgres constraint; each batch is applied
//! under one write lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{ActivityCounts, CityDirectory, EventStore, UpsertCounts};
use crate::error::Result;
use crate::schemas::{EnabledCity, ExternalEvent, StoredEvent};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryEventStore {
    rows: RwLock<HashMap<Key, StoredEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts a row in place as-is (seeding prior runs in tests)
    pub fn insert_row(&self, row: StoredEvent) {
        let key = (row.source.clone(), row.external_event_id.clone());
        self.rows.write().insert(key, row);
    }

    pub fn get(&self, source: &str, external_id: &str) -> Option<StoredEvent> {
        self.rows
            .read()
            .get(&(source.to_string(), external_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn all_rows(&self) -> Vec<StoredEvent> {
        self.rows.read().values().cloned().collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_events(
        &self,
        source: &str,
        city: &str,
        state: &str,
        events: &[ExternalEvent],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        let mut rows = self.rows.write();

        for event in events {
            let key = (source.to_string(), event.external_id.clone());
            match rows.get_mut(&key) {
                Some(row) => {
                    row.refresh(city, state, event, now);
                    counts.updated += 1;
                }
                None => {
                    rows.insert(key, StoredEvent::first_sighting(source, city, state, event, now));
                    counts.inserted += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn deactivate_stale(&self, source: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deactivated = 0;
        for row in self.rows.write().values_mut() {
            if row.source == source && row.is_active && row.last_fetched_at < cutoff {
                row.is_active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn count_by_activity(&self, source: &str) -> Result<ActivityCounts> {
        let mut counts = ActivityCounts::default();
        for row in self.rows.read().values().filter(|r| r.source == source) {
            if row.is_active {
                counts.active += 1;
            } else {
                counts.inactive += 1;
            }
        }
        Ok(counts)
    }
}

/// Fixed city list, filtered on `events_enabled`
#[derive(Debug, Clone, Default)]
pub struct StaticCityDirectory {
    cities: Vec<EnabledCity>,
}

impl StaticCityDirectory {
    pub fn new(cities: Vec<EnabledCity>) -> Self {
        Self { cities }
    }
}

#[async_trait]
impl CityDirectory for StaticCityDirectory {
    async fn enabled_cities(&self) -> Result<Vec<EnabledCity>> {
        Ok(self.cities.iter().filter(|c| c.events_enabled).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_filters_disabled() {
        let mut disabled = EnabledCity::new("Dallas", "TX");
        disabled.events_enabled = false;
        let directory = StaticCityDirectory::new(vec![EnabledCity::new("Austin", "TX"), disabled]);

        let cities = directory.enabled_cities().await.unwrap();
        assert_eq!(cities, vec![EnabledCity::new("Austin", "TX")]);
    }

    #[tokio::test]
    async fn test_count_by_activity() {
        let store = MemoryEventStore::new();
        let event = |id: &str| ExternalEvent {
            external_id: id.to_string(),
            title: "Open Mic".to_string(),
            description: None,
            start_time: Utc::now(),
            end_time: None,
            venue_name: None,
            external_url: format!("https://example.com/{}", id),
        };
        let now = Utc::now();
        store
            .upsert_events("meetup", "Austin", "TX", &[event("a"), event("b")], now)
            .await
            .unwrap();
        store
            .upsert_events("eventbrite", "Austin", "TX", &[event("c")], now)
            .await
            .unwrap();

        let mut retired = store.get("meetup", "a").unwrap();
        retired.is_active = false;
        store.insert_row(retired);

        let counts = store.count_by_activity("meetup").await.unwrap();
        assert_eq!(counts, ActivityCounts { active: 1, inactive: 1 });
        assert_eq!(
            store.count_by_activity("ticketmaster").await.unwrap(),
            ActivityCounts::default()
        );
    }
}
