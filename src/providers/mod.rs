//! External event providers
//!
//! Each provider implements `Provider`: fetch one page of events around a
//! city and say whether it was the last one. Request shapes, auth and page
//! numbering differ per provider; the pagination driver only sees the trait.

pub mod eventbrite;
pub mod meetup;
pub mod ticketmaster;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::Config;
use crate::error::Result;
use crate::http_client::{HttpOutcome, ResilientHttpClient};
use crate::schemas::LocationQuery;

pub use eventbrite::{EventbriteEvent, EventbriteProvider};
pub use meetup::{MeetupEvent, MeetupProvider};
pub use ticketmaster::{TicketmasterEvent, TicketmasterProvider};

/// A provider-specific record as it came off the wire
#[derive(Debug, Clone)]
pub enum RawRecord {
    Ticketmaster(TicketmasterEvent),
    Eventbrite(EventbriteEvent),
    Meetup(MeetupEvent),
}

/// One page of raw records
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub records: Vec<RawRecord>,
    /// Entries on the page that did not decode into the provider's record shape
    pub undecodable: usize,
    pub is_last_page: bool,
}

impl RawPage {
    /// Decodes each entry on its own, so a malformed record only costs itself
    pub(crate) fn decode<T: DeserializeOwned>(
        source: &str,
        entries: Vec<Value>,
        wrap: fn(T) -> RawRecord,
        is_last_page: bool,
    ) -> Self {
        let mut page = RawPage {
            records: Vec::with_capacity(entries.len()),
            undecodable: 0,
            is_last_page,
        };

        for entry in entries {
            match serde_json::from_value::<T>(entry) {
                Ok(record) => page.records.push(wrap(record)),
                Err(e) => {
                    debug!(source, error = %e, "Skipping undecodable record");
                    page.undecodable += 1;
                }
            }
        }

        page
    }

    /// Entries the provider returned, decodable or not
    pub fn entries(&self) -> usize {
        self.records.len() + self.undecodable
    }
}

/// What a page request produced, short of a fatal error
#[derive(Debug)]
pub enum PageOutcome {
    Page(RawPage),
    /// Provider answered 429; the same page should be retried later
    RateLimited { retry_after: Option<Duration> },
}

impl<T> HttpOutcome<T> {
    /// Maps a decoded body into a page, passing rate limits through
    pub(crate) fn into_page(self, f: impl FnOnce(T) -> RawPage) -> PageOutcome {
        match self {
            HttpOutcome::Ok(body) => PageOutcome::Page(f(body)),
            HttpOutcome::RateLimited { retry_after } => PageOutcome::RateLimited { retry_after },
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Source name, the first half of the stored identity key
    fn source(&self) -> &'static str;

    /// Index of the first page (0 or 1 depending on the API)
    fn start_page(&self) -> u32;

    /// Maximum pages to fetch per city
    fn max_pages(&self) -> u32;

    /// Fetches a single page of events around `query`
    async fn fetch_page(&self, query: &LocationQuery, page: u32) -> Result<PageOutcome>;
}

/// Builds every provider that has credentials configured
pub fn build_providers(config: &Config, http: Arc<ResilientHttpClient>) -> Vec<Arc<dyn Provider>> {
    let cb_config = CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker_failure_threshold,
        open_duration: Duration::from_secs(config.circuit_breaker_open_duration_secs),
        ..Default::default()
    };
    let breaker = |source: &str| Arc::new(CircuitBreaker::new(source, cb_config.clone()));

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(ref api_key) = config.ticketmaster_api_key {
        providers.push(Arc::new(TicketmasterProvider::new(
            http.clone(),
            &config.ticketmaster_base_url,
            api_key.clone(),
            config.ticketmaster_max_pages,
            config.ticketmaster_rate_limit_rpm,
            breaker(ticketmaster::SOURCE),
        )));
        info!(max_pages = config.ticketmaster_max_pages, "Ticketmaster provider initialized");
    }

    if let Some(ref token) = config.eventbrite_token {
        providers.push(Arc::new(EventbriteProvider::new(
            http.clone(),
            &config.eventbrite_base_url,
            token.clone(),
            config.eventbrite_max_pages,
            config.eventbrite_rate_limit_rpm,
            breaker(eventbrite::SOURCE),
        )));
        info!(max_pages = config.eventbrite_max_pages, "Eventbrite provider initialized");
    }

    if let Some(ref api_key) = config.meetup_api_key {
        providers.push(Arc::new(
            MeetupProvider::new(
                http.clone(),
                &config.meetup_base_url,
                api_key.clone(),
                config.meetup_max_pages,
                config.meetup_rate_limit_rpm,
                breaker(meetup::SOURCE),
            )
            .with_text_filter(config.meetup_text_filter.clone()),
        ));
        info!(max_pages = config.meetup_max_pages, "Meetup provider initialized");
    }

    providers
}
