//! Pagination driver
//!
//! Walks a provider's pages for one city until the provider says it is done
//! or the provider's page cap is reached. A rate-limited page is retried in
//! place after a backoff and does not count against the cap; consecutive
//! rate limits on one page are bounded by the retry policy.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{IngestionError, Result};
use crate::metrics;
use crate::providers::{PageOutcome, Provider, RawRecord};
use crate::schemas::LocationQuery;

/// Backoff and pacing knobs for the pagination loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Rate-limit retries allowed for a single page before giving up
    pub max_attempts: u32,
    /// Sleep after the first 429 on a page
    pub base_delay: Duration,
    /// Upper bound for any single backoff sleep
    pub max_delay: Duration,
    /// Growth factor per consecutive 429 (1.0 keeps the delay fixed)
    pub multiplier: f64,
    /// Random spread applied to each backoff, 0.0..=1.0 (0.5 means +/- 50%)
    pub jitter: f64,
    /// Pause between successive pages
    pub inter_page_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
            jitter: 0.0,
            inter_page_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.rate_limit_max_retries,
            base_delay: Duration::from_millis(config.rate_limit_backoff_ms),
            inter_page_delay: Duration::from_millis(config.inter_page_delay_ms),
            ..Default::default()
        }
    }

    /// No sleeping at all; for tests
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            inter_page_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based) of the same page.
    /// A provider-supplied `Retry-After` wins when it is longer.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let mut secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        if self.jitter > 0.0 {
            let spread = self.jitter.min(1.0);
            secs *= 1.0 - spread + rand::random::<f64>() * 2.0 * spread;
        }

        let computed = Duration::from_secs_f64(secs).min(self.max_delay);
        match retry_after {
            Some(hint) => computed.max(hint.min(self.max_delay)),
            None => computed,
        }
    }
}

/// Everything the driver collected for one city and provider
#[derive(Debug, Default)]
pub struct PaginationResult {
    pub records: Vec<RawRecord>,
    /// Entries skipped because they did not decode
    pub undecodable: usize,
    pub pages_fetched: u32,
    pub rate_limit_retries: u32,
}

/// Fetches pages from `provider` for `query` until done or capped
pub async fn fetch_all_pages(
    provider: &dyn Provider,
    query: &LocationQuery,
    policy: &RetryPolicy,
) -> Result<PaginationResult> {
    let source = provider.source();
    let max_pages = provider.max_pages();
    let mut page = provider.start_page();
    let mut result = PaginationResult::default();
    let mut attempts_on_page = 0u32;

    while result.pages_fetched < max_pages {
        let started = Instant::now();

        match provider.fetch_page(query, page).await {
            Ok(PageOutcome::RateLimited { retry_after }) => {
                metrics::record_rate_limited(source);
                attempts_on_page += 1;
                result.rate_limit_retries += 1;

                if attempts_on_page > policy.max_attempts {
                    return Err(IngestionError::RateLimitExhausted {
                        source_name: source.to_string(),
                        page,
                        attempts: attempts_on_page,
                    });
                }

                let delay = policy.backoff_delay(attempts_on_page, retry_after);
                warn!(
                    source,
                    city = %query.city,
                    page,
                    attempt = attempts_on_page,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, retrying same page"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(PageOutcome::Page(raw)) => {
                metrics::record_page_fetched(source, started.elapsed().as_secs_f64());
                attempts_on_page = 0;
                result.pages_fetched += 1;

                let count = raw.entries();
                result.undecodable += raw.undecodable;
                result.records.extend(raw.records);

                debug!(
                    source,
                    city = %query.city,
                    page,
                    count,
                    last = raw.is_last_page,
                    "Page fetched"
                );

                if raw.is_last_page || count == 0 {
                    break;
                }

                page += 1;
                if result.pages_fetched < max_pages && !policy.inter_page_delay.is_zero() {
                    tokio::time::sleep(policy.inter_page_delay).await;
                }
            }
            Err(e) => {
                metrics::record_provider_error(source, e.kind());
                return Err(e);
            }
        }
    }

    Ok(result)
}
