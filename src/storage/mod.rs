//! Storage layer
//!
//! The pipeline never reaches for a global connection: the sync engine and
//! the orchestrator are handed an `EventStore` and a `CityDirectory`.
//! `postgres` is the production backend, `memory` backs tests and dry runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::schemas::{EnabledCity, ExternalEvent};

pub use memory::{MemoryEventStore, StaticCityDirectory};
pub use postgres::{PgCityDirectory, PgEventStore};

/// Outcome of one upsert batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Row counts of one source split by `is_active`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    pub active: u64,
    pub inactive: u64,
}

/// Persistence for canonical events, keyed by `(source, external_event_id)`
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts unseen events and refreshes known ones, marking all of them
    /// active with `last_fetched_at = now`. Must be safe to call concurrently;
    /// rows are written in the order given, so callers pass batches sorted by
    /// external id to keep lock order consistent across transactions.
    async fn upsert_events(
        &self,
        source: &str,
        city: &str,
        state: &str,
        events: &[ExternalEvent],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts>;

    /// Deactivates active rows of `source` last fetched before `cutoff`
    async fn deactivate_stale(&self, source: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Active and inactive row counts for a source
    async fn count_by_activity(&self, source: &str) -> Result<ActivityCounts>;
}

/// Read-only view of the city configuration store
#[async_trait]
pub trait CityDirectory: Send + Sync {
    /// Cities with events enabled
    async fn enabled_cities(&self) -> Result<Vec<EnabledCity>>;
}
