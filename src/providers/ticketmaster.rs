//! Ticketmaster Discovery API provider
//!
//! https://developer.ticketmaster.com/products-and-docs/apis/discovery-api/v2/
//!
//! Zero-based pages; the response carries `page.totalPages`. The API key goes
//! in the query string.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{PageOutcome, Provider, RawPage, RawRecord};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::http_client::{ProviderHttpClient, ResilientHttpClient};
use crate::schemas::LocationQuery;

pub const SOURCE: &str = "ticketmaster";

const PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedEvents>,
    page: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedEvents {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    number: Option<u32>,
    total_pages: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketmasterEvent {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub info: Option<String>,
    pub description: Option<String>,
    pub dates: Option<TicketmasterDates>,
    #[serde(rename = "_embedded")]
    pub embedded: Option<TicketmasterEmbedded>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketmasterDates {
    pub start: Option<TicketmasterDate>,
    pub end: Option<TicketmasterDate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketmasterDate {
    pub date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketmasterEmbedded {
    #[serde(default)]
    pub venues: Vec<TicketmasterVenue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketmasterVenue {
    pub name: Option<String>,
}

pub struct TicketmasterProvider {
    client: ProviderHttpClient,
    base_url: String,
    api_key: String,
    max_pages: u32,
}

impl TicketmasterProvider {
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
        }
    }

    fn query_params(&self, query: &LocationQuery, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("city", query.city.clone()),
            ("stateCode", query.state.clone()),
            ("radius", query.radius_miles.to_string()),
            ("unit", "miles".to_string()),
            ("size", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
            ("sort", "date,asc".to_string()),
            ("apikey", self.api_key.clone()),
        ]
    }
}

fn into_page(body: SearchResponse, requested_page: u32) -> RawPage {
    // No page block means no results at all
    let is_last_page = match body.page {
        Some(PageInfo { total_pages: Some(total), number }) => {
            number.unwrap_or(requested_page) + 1 >= total
        }
        _ => true,
    };

    let entries = body.embedded.map(|e| e.events).unwrap_or_default();
    RawPage::decode(SOURCE, entries, RawRecord::Ticketmaster, is_last_page)
}

#[async_trait]
impl Provider for TicketmasterProvider {
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
        let url = format!("{}/discovery/v2/events.json", self.base_url);
        let params = self.query_params(query, page);

        debug!(source = SOURCE, city = %query.city, state = %query.state, page, "Fetching events");

        let outcome = self.client.get_json::<SearchResponse>(&url, &params, None).await?;
        Ok(outcome.into_page(|body| into_page(body, page)))
    }
}
