//! Meetup provider
//!
//! The upcoming-events search has no page-count field, so every response is
//! treated as the last page. Times come back as epoch milliseconds with a
//! separate duration.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{PageOutcome, Provider, RawPage, RawRecord};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::http_client::{ProviderHttpClient, ResilientHttpClient};
use crate::schemas::LocationQuery;

pub const SOURCE: &str = "meetup";

/// Results per request (Meetup's `page` parameter is a page size)
const PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeetupEvent {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    /// Start, epoch milliseconds
    pub time: Option<i64>,
    /// Length in milliseconds
    pub duration: Option<i64>,
    pub venue: Option<MeetupVenue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeetupVenue {
    pub name: Option<String>,
}

pub struct MeetupProvider {
    client: ProviderHttpClient,
    base_url: String,
    api_key: String,
    max_pages: u32,
    text_filter: Option<String>,
}

impl MeetupProvider {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        base_url: &str,
        api_key: String,
        max_pages: u32,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: ProviderHttpClient::new(http_client, SOURCE, rate_limit_rpm, circuit_breaker),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            max_pages,
            text_filter: None,
        }
    }

    pub fn with_text_filter(mut self, text: Option<String>) -> Self {
        self.text_filter = text.filter(|t| !t.trim().is_empty());
        self
    }

    fn query_params(&self, query: &LocationQuery) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("key", self.api_key.clone()),
            ("sign", "true".to_string()),
            ("radius", query.radius_miles.to_string()),
            ("city", query.city.clone()),
            ("state", query.state.clone()),
            ("page", PAGE_SIZE.to_string()),
        ];
        if let Some(ref text) = self.text_filter {
            params.push(("text", text.clone()));
        }
        params
    }
}

#[async_trait]
impl Provider for MeetupProvider {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn start_page(&self) -> u32 {
        0
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn fetch_page(&self, query: &LocationQuery, page: u32) -> Result<PageOutcome> {
        let url = format!("{}/find/upcoming_events", self.base_url);
        let params = self.query_params(query);

        debug!(source = SOURCE, city = %query.city, state = %query.state, page, "Fetching events");

        let outcome = self.client.get_json::<SearchResponse>(&url, &params, None).await?;
        Ok(outcome.into_page(|body| RawPage::decode(SOURCE, body.events, RawRecord::Meetup, true)))
    }
}
