//! Sync engine: idempotent upserts and the staleness sweep

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics;
use crate::schemas::ExternalEvent;
use crate::storage::{EventStore, UpsertCounts};

pub struct SyncEngine {
    store: Arc<dyn EventStore>,
    stale_window: Duration,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn EventStore>, stale_window: Duration) -> Self {
        Self { store, stale_window }
    }

    /// Writes one `(source, city, state)` batch. Safe to repeat with the same input.
    pub async fn upsert_batch(
        &self,
        source: &str,
        city: &str,
        state: &str,
        events: Vec<ExternalEvent>,
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        let events = collapse_and_order(events);
        if events.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let counts = self.store.upsert_events(source, city, state, &events, now).await?;
        metrics::record_upserted(source, counts.total());

        debug!(
            source,
            city,
            state,
            inserted = counts.inserted,
            updated = counts.updated,
            "Batch upserted"
        );

        Ok(counts)
    }

    /// Deactivates every row of `source` not refreshed within the stale window
    pub async fn sweep_stale(&self, source: &str, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.stale_window;
        let deactivated = self.store.deactivate_stale(source, cutoff).await?;
        metrics::record_deactivated(source, deactivated);

        info!(source, cutoff = %cutoff, deactivated, "Staleness sweep complete");
        Ok(deactivated)
    }
}

/// Keeps the last sighting of each external id and orders the batch by id.
/// Providers occasionally repeat an event across pages, and a fixed write
/// order means concurrent batches sharing events lock rows in the same order.
fn collapse_and_order(events: Vec<ExternalEvent>) -> Vec<ExternalEvent> {
    let mut by_id: BTreeMap<String, ExternalEvent> = BTreeMap::new();
    for event in events {
        by_id.insert(event.external_id.clone(), event);
    }
    by_id.into_values().collect()
}
