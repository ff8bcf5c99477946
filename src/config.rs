//! Configuration for the events ingestion pipeline
//!
//! Everything comes from the process environment (a `.env` file is loaded
//! first when present). Variable names map one-to-one onto field names, e.g.
//! `EVENTS_STALE_DAYS` -> `events_stale_days`.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{IngestionError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Database
    pub database_url: Option<String>,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    // Provider credentials
    pub ticketmaster_api_key: Option<String>,
    pub eventbrite_token: Option<String>,
    pub meetup_api_key: Option<String>,

    /// Optional keyword filter for Meetup searches
    pub meetup_text_filter: Option<String>,

    // Provider endpoints
    #[serde(default = "default_ticketmaster_base_url")]
    pub ticketmaster_base_url: String,
    #[serde(default = "default_eventbrite_base_url")]
    pub eventbrite_base_url: String,
    #[serde(default = "default_meetup_base_url")]
    pub meetup_base_url: String,

    // Page caps per city
    #[serde(default = "default_max_pages")]
    pub ticketmaster_max_pages: u32,
    #[serde(default = "default_max_pages")]
    pub eventbrite_max_pages: u32,
    #[serde(default = "default_max_pages")]
    pub meetup_max_pages: u32,

    // Rate limiting (requests per minute)
    #[serde(default = "default_ticketmaster_rate_limit")]
    pub ticketmaster_rate_limit_rpm: u32,
    #[serde(default = "default_eventbrite_rate_limit")]
    pub eventbrite_rate_limit_rpm: u32,
    #[serde(default = "default_meetup_rate_limit")]
    pub meetup_rate_limit_rpm: u32,

    // Search and sync
    #[serde(default = "default_radius_miles")]
    pub events_radius_miles: u32,
    #[serde(default = "default_stale_days")]
    pub events_stale_days: u32,

    // Concurrency
    #[serde(default = "default_workers")]
    pub events_workers: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    // Backoff
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_ms: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_inter_page_delay")]
    pub inter_page_delay_ms: u64,

    // Circuit breaker
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_open_duration_secs: u64,
}

fn default_database_max_connections() -> u32 {
    8
}

fn default_ticketmaster_base_url() -> String {
    "https://app.ticketmaster.com".to_string()
}

fn default_eventbrite_base_url() -> String {
    "https://www.eventbriteapi.com".to_string()
}

fn default_meetup_base_url() -> String {
    "https://api.meetup.com".to_string()
}

fn default_max_pages() -> u32 {
    3
}

fn default_ticketmaster_rate_limit() -> u32 {
    300 // Discovery API: 5 requests/sec
}

fn default_eventbrite_rate_limit() -> u32 {
    120
}

fn default_meetup_rate_limit() -> u32 {
    60
}

fn default_radius_miles() -> u32 {
    15
}

fn default_stale_days() -> u32 {
    2
}

fn default_workers() -> usize {
    4
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_limit_backoff() -> u64 {
    1500
}

fn default_rate_limit_max_retries() -> u32 {
    5
}

fn default_inter_page_delay() -> u64 {
    300
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_database_max_connections(),
            ticketmaster_api_key: None,
            eventbrite_token: None,
            meetup_api_key: None,
            meetup_text_filter: None,
            ticketmaster_base_url: default_ticketmaster_base_url(),
            eventbrite_base_url: default_eventbrite_base_url(),
            meetup_base_url: default_meetup_base_url(),
            ticketmaster_max_pages: default_max_pages(),
            eventbrite_max_pages: default_max_pages(),
            meetup_max_pages: default_max_pages(),
            ticketmaster_rate_limit_rpm: default_ticketmaster_rate_limit(),
            eventbrite_rate_limit_rpm: default_eventbrite_rate_limit(),
            meetup_rate_limit_rpm: default_meetup_rate_limit(),
            events_radius_miles: default_radius_miles(),
            events_stale_days: default_stale_days(),
            events_workers: default_workers(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout(),
            rate_limit_backoff_ms: default_rate_limit_backoff(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            inter_page_delay_ms: default_inter_page_delay(),
            circuit_breaker_failure_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_open_duration_secs: default_circuit_breaker_timeout(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Rejects settings that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        for (name, pages) in [
            ("TICKETMASTER_MAX_PAGES", self.ticketmaster_max_pages),
            ("EVENTBRITE_MAX_PAGES", self.eventbrite_max_pages),
            ("MEETUP_MAX_PAGES", self.meetup_max_pages),
        ] {
            if pages == 0 {
                return Err(IngestionError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        if self.events_workers == 0 {
            return Err(IngestionError::InvalidConfig(
                "EVENTS_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.events_stale_days == 0 {
            return Err(IngestionError::InvalidConfig(
                "EVENTS_STALE_DAYS must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(IngestionError::InvalidConfig(
                "MAX_CONCURRENT_REQUESTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_ticketmaster(&self) -> bool {
        self.ticketmaster_api_key.is_some()
    }

    pub fn has_eventbrite(&self) -> bool {
        self.eventbrite_token.is_some()
    }

    pub fn has_meetup(&self) -> bool {
        self.meetup_api_key.is_some()
    }

    pub fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.events_stale_days as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
