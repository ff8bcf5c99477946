//! Postgres backend (runtime queries, no compile-time database needed)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ActivityCounts, CityDirectory, EventStore, UpsertCounts};
use crate::error::Result;
use crate::schemas::{EnabledCity, ExternalEvent};

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS external_events (
    id                UUID PRIMARY KEY,
    source            TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    title             TEXT NOT NULL,
    description       TEXT,
    start_time        TIMESTAMPTZ NOT NULL,
    end_time          TIMESTAMPTZ,
    venue_name        TEXT,
    external_url      TEXT NOT NULL,
    city              TEXT NOT NULL,
    state             TEXT NOT NULL,
    is_active         BOOLEAN NOT NULL DEFAULT TRUE,
    last_fetched_at   TIMESTAMPTZ NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT external_events_source_external_id_key UNIQUE (source, external_event_id)
)
"#;

const CREATE_SWEEP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS external_events_active_fetched_idx
    ON external_events (source, last_fetched_at)
    WHERE is_active
"#;

/// Opens a pool sized for the worker count
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!(max_connections, "Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgEventStore {
    db: PgPool,
}

impl PgEventStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Creates the events table and its sweep index if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_EVENTS_TABLE).execute(&self.db).await?;
        sqlx::query(CREATE_SWEEP_INDEX).execute(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_events(
        &self,
        source: &str,
        city: &str,
        state: &str,
        events: &[ExternalEvent],
        now: DateTime<Utc>,
    ) -> Result<UpsertCounts> {
        debug!(source, city, state, count = events.len(), "Upserting events");

        let mut counts = UpsertCounts::default();
        let mut tx = self.db.begin().await?;

        for event in events {
            // xmax = 0 only for a freshly inserted tuple
            let inserted: bool = sqlx::query_scalar(
                r#"
                INSERT INTO external_events (
                    id, source, external_event_id, title, description, start_time, end_time,
                    venue_name, external_url, city, state, is_active, last_fetched_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE, $12, $12)
                ON CONFLICT (source, external_event_id) DO UPDATE SET
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    start_time = EXCLUDED.start_time,
                    end_time = EXCLUDED.end_time,
                    venue_name = EXCLUDED.venue_name,
                    external_url = EXCLUDED.external_url,
                    city = EXCLUDED.city,
                    state = EXCLUDED.state,
                    is_active = TRUE,
                    last_fetched_at = EXCLUDED.last_fetched_at
                RETURNING (xmax = 0)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(source)
            .bind(&event.external_id)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.start_time)
            .bind(event.end_time)
            .bind(&event.venue_name)
            .bind(&event.external_url)
            .bind(city)
            .bind(state)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            if inserted {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn deactivate_stale(&self, source: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE external_events
            SET is_active = FALSE
            WHERE source = $1 AND is_active AND last_fetched_at < $2
            "#,
        )
        .bind(source)
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_activity(&self, source: &str) -> Result<ActivityCounts> {
        let rows: Vec<(bool, i64)> = sqlx::query_as(
            r#"
            SELECT is_active, COUNT(*)
            FROM external_events
            WHERE source = $1
            GROUP BY is_active
            "#,
        )
        .bind(source)
        .fetch_all(&self.db)
        .await?;

        let mut counts = ActivityCounts::default();
        for (is_active, count) in rows {
            if is_active {
                counts.active = count as u64;
            } else {
                counts.inactive = count as u64;
            }
        }
        Ok(counts)
    }
}

/// Reads enabled cities from the city configuration table
#[derive(Clone)]
pub struct PgCityDirectory {
    db: PgPool,
}

impl PgCityDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CityDirectory for PgCityDirectory {
    async fn enabled_cities(&self) -> Result<Vec<EnabledCity>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT city, state
            FROM enabled_cities
            WHERE events_enabled = TRUE
            ORDER BY state, city
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(city, state)| EnabledCity::new(city, state))
            .collect())
    }
}
