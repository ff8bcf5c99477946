//! HTTP Client Module
//!
//! Two layers:
//! - `ResilientHttpClient`: one reqwest client shared by every provider, with
//!   request/connect timeouts and a global semaphore capping in-flight requests.
//! - `ProviderHttpClient`: one per provider, adding that provider's token-bucket
//!   rate limiter and circuit breaker. Every city worker talking to the same
//!   provider goes through the same instance, so limits hold under concurrency.
//!
//! HTTP 429 is not an error at this layer. It comes back as
//! `HttpOutcome::RateLimited` and the pagination driver decides what to do.

use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{IngestionError, Result};

/// Longest error body kept in an `ApiError` message
const MAX_ERROR_BODY: usize = 512;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum concurrent requests across all providers
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("community-events-ingestion/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct ResilientHttpClient {
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl ResilientHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpClientConfig::default())
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Result of a single provider request that did not fail outright
#[derive(Debug)]
pub enum HttpOutcome<T> {
    Ok(T),
    RateLimited { retry_after: Option<Duration> },
}

pub struct ProviderHttpClient {
    http: Arc<ResilientHttpClient>,
    rate_limiter: DirectLimiter,
    circuit_breaker: Arc<CircuitBreaker>,
    source: &'static str,
}

impl ProviderHttpClient {
    pub fn new(
        http: Arc<ResilientHttpClient>,
        source: &'static str,
        rate_limit_rpm: u32,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(rate_limit_rpm).unwrap_or(NonZeroU32::MIN));

        Self {
            http,
            rate_limiter: RateLimiter::direct(quota),
            circuit_breaker,
            source,
        }
    }

    /// GETs `url` and decodes a JSON body, with every protection applied
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<HttpOutcome<T>> {
        if !self.circuit_breaker.allow_request() {
            return Err(IngestionError::CircuitBreakerOpen(self.source.to_string()));
        }

        self.rate_limiter.until_ready().await;

        let _permit = self
            .http
            .semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::ConnectionLost("HTTP semaphore closed".to_string()))?;

        let mut request = self.http.inner().get(url).query(query);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        debug!(source = self.source, url = %url, "Requesting provider page");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.circuit_breaker.record_failure();
                return Err(IngestionError::HttpError(e));
            }
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_neutral();
            let retry_after = parse_retry_after(response.headers());
            warn!(
                source = self.source,
                retry_after = ?retry_after,
                "Provider rate limited request"
            );
            return Ok(HttpOutcome::RateLimited { retry_after });
        }

        if !status.is_success() {
            // A 4xx is about this request (bad city, bad params), not provider health
            if status.is_client_error() {
                self.circuit_breaker.record_neutral();
            } else {
                self.circuit_breaker.record_failure();
            }
            let mut body = response.text().await.unwrap_or_default();
            truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(IngestionError::ApiError {
                source_name: self.source.to_string(),
                status: status.as_u16(),
                message: body,
            });
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                self.circuit_breaker.record_failure();
                return Err(IngestionError::HttpError(e));
            }
        };

        match serde_json::from_str(&text) {
            Ok(body) => {
                self.circuit_breaker.record_success();
                Ok(HttpOutcome::Ok(body))
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                Err(IngestionError::JsonError(e))
            }
        }
    }
}

/// Reads a `Retry-After` header given in seconds
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_config_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_semaphore_limiting() {
        let config = HttpClientConfig {
            max_concurrent_requests: 2,
            ..Default::default()
        };
        let client = ResilientHttpClient::new(config).unwrap();
        assert_eq!(client.available_permits(), 2);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let mut body = "é".repeat(10);
        truncate_at_char_boundary(&mut body, 5);
        assert_eq!(body, "éé");
    }
}
