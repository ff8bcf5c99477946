//! Eventbrite provider
//!
//! One-based pages; the response carries `pagination.page_count` and
//! `has_more_items`. Authenticated with a bearer token header.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{PageOutcome, Provider, RawPage, RawRecord};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::http_client::{ProviderHttpClient, ResilientHttpClient};
use crate::schemas::LocationQuery;

pub const SOURCE: &str = "eventbrite";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    events: Vec<serde_json::Value>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    page_number: Option<u32>,
    page_count: Option<u32>,
    has_more_items: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventbriteEvent {
    pub id: Option<String>,
    pub name: Option<EventbriteText>,
    pub description: Option<EventbriteText>,
    pub url: Option<String>,
    pub start: Option<EventbriteTime>,
    pub end: Option<EventbriteTime>,
    pub venue: Option<EventbriteVenue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventbriteText {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventbriteTime {
    pub utc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventbriteVenue {
    pub name: Option<String>,
}

pub struct EventbriteProvider {
    client: ProviderHttpClient,
    base_url: String,
    token: String,
    max_pages: u32,
}

impl EventbriteProvider {
    pub fn new(
        http_client: Arc<ResilientHttpClient>,
        base_url: &str,
        token: String,
        max_pages: u32,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client: ProviderHttpClient::new(http_client, SOURCE, rate_limit_rpm, circuit_breaker),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_pages,
        }
    }

    fn query_params(query: &LocationQuery, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("location.address", format!("{}, {}", query.city, query.state)),
            ("location.within", format!("{}mi", query.radius_miles)),
            ("sort_by", "date".to_string()),
            ("expand", "venue".to_string()),
            ("page", page.to_string()),
        ]
    }
}

fn into_page(body: SearchResponse, requested_page: u32) -> RawPage {
    let is_last_page = match body.pagination {
        Some(p) => {
            let exhausted = match p.page_count {
                Some(count) => p.page_number.unwrap_or(requested_page) >= count,
                None => false,
            };
            exhausted || p.has_more_items == Some(false)
        }
        None => true,
    };

    RawPage::decode(SOURCE, body.events, RawRecord::Eventbrite, is_last_page)
}

#[async_trait]
impl Provider for EventbriteProvider {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn start_page(&self) -> u32 {
        1
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn fetch_page(&self, query: &LocationQuery, page: u32) -> Result<PageOutcome> {
        let url = format!("{}/v3/events/search/", self.base_url);
        let params = Self::query_params(query, page);

        debug!(source = SOURCE, city = %query.city, state = %query.state, page, "Fetching events");

        let outcome = self
            .client
            .get_json::<SearchResponse>(&url, &params, Some(&self.token))
            .await?;
        Ok(outcome.into_page(|body| into_page(body, page)))
    }
}
