//! Run orchestration
//!
//! One run: read enabled cities, fan cities out over a bounded worker pool
//! (each worker walks every provider for its city), wait for all of them,
//! then sweep stale rows once per provider source.
//!
//! A failing city/provider pair is logged and counted; it never stops the
//! run. Only an unreadable city list or a failed sweep fails the run.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{IngestionError, Result};
use crate::metrics;
use crate::normalizer::normalize_batch;
use crate::pagination::{fetch_all_pages, RetryPolicy};
use crate::providers::Provider;
use crate::schemas::{EnabledCity, LocationQuery};
use crate::storage::CityDirectory;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Pending,
    Fetching,
    Sweeping,
    Done,
    Failed,
}

/// Per-source totals for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTally {
    pub pages_fetched: u64,
    pub rate_limit_retries: u64,
    pub records_fetched: u64,
    pub records_dropped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed_cities: u64,
    pub deactivated: u64,
}

impl SourceTally {
    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cities: usize,
    pub sources: BTreeMap<String, SourceTally>,
}

impl RunReport {
    pub fn events_upserted(&self) -> u64 {
        self.sources.values().map(SourceTally::upserted).sum()
    }

    pub fn rows_deactivated(&self) -> u64 {
        self.sources.values().map(|t| t.deactivated).sum()
    }

    pub fn failures(&self) -> u64 {
        self.sources.values().map(|t| t.failed_cities).sum()
    }
}

/// What one city/provider pair produced
#[derive(Debug)]
struct PairOutcome {
    source: &'static str,
    tally: SourceTally,
}

pub struct RunOrchestrator {
    providers: Arc<[Arc<dyn Provider>]>,
    cities: Arc<dyn CityDirectory>,
    sync: Arc<SyncEngine>,
    policy: RetryPolicy,
    radius_miles: u32,
    workers: usize,
    phase: Mutex<RunPhase>,
}

impl RunOrchestrator {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        cities: Arc<dyn CityDirectory>,
        sync: Arc<SyncEngine>,
        policy: RetryPolicy,
        radius_miles: u32,
        workers: usize,
    ) -> Self {
        Self {
            providers: providers.into(),
            cities,
            sync,
            policy,
            radius_miles,
            workers: workers.max(1),
            phase: Mutex::new(RunPhase::Pending),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: RunPhase) {
        info!(phase = ?phase, "Run phase");
        *self.phase.lock() = phase;
    }

    /// Executes one full run
    pub async fn run(&self, run_id: &str) -> Result<RunReport> {
        self.enter(RunPhase::Pending);
        let started_at = Utc::now();

        let cities = match self.cities.enabled_cities().await {
            Ok(cities) => cities,
            Err(e) => {
                error!(error = %e, "Failed to read enabled cities");
                self.enter(RunPhase::Failed);
                return Err(e);
            }
        };

        info!(
            cities = cities.len(),
            providers = self.providers.len(),
            workers = self.workers,
            "Starting ingestion run"
        );

        let mut sources: BTreeMap<String, SourceTally> = self
            .providers
            .iter()
            .map(|p| (p.source().to_string(), SourceTally::default()))
            .collect();

        self.enter(RunPhase::Fetching);
        for outcome in self.fetch_all_cities(run_id, &cities).await {
            let tally = sources.entry(outcome.source.to_string()).or_default();
            merge(tally, &outcome.tally);
        }

        // Every city task has joined; sweeps can no longer race an upsert
        self.enter(RunPhase::Sweeping);
        let mut sweep_error: Option<IngestionError> = None;
        for provider in self.providers.iter() {
            let source = provider.source();
            match self.sync.sweep_stale(source, Utc::now()).await {
                Ok(deactivated) => {
                    sources.entry(source.to_string()).or_default().deactivated = deactivated;
                }
                Err(e) => {
                    error!(source, error = %e, "Staleness sweep failed");
                    sweep_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = sweep_error {
            self.enter(RunPhase::Failed);
            return Err(e);
        }

        let report = RunReport {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            cities: cities.len(),
            sources,
        };

        self.enter(RunPhase::Done);
        info!(
            cities = report.cities,
            upserted = report.events_upserted(),
            deactivated = report.rows_deactivated(),
            failures = report.failures(),
            "Ingestion run complete"
        );

        Ok(report)
    }

    /// Runs every city through the worker pool and waits for all of them
    async fn fetch_all_cities(&self, run_id: &str, cities: &[EnabledCity]) -> Vec<PairOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(cities.len());

        for city in cities {
            let semaphore = semaphore.clone();
            let providers = self.providers.clone();
            let sync = self.sync.clone();
            let policy = self.policy.clone();
            let query = LocationQuery::for_city(city, self.radius_miles);
            let span = info_span!("city", run_id = %run_id, city = %city.city, state = %city.state);

            let handle = tokio::spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Vec::new();
                    };
                    let mut outcomes = Vec::with_capacity(providers.len());
                    for provider in providers.iter() {
                        outcomes.push(ingest_city(provider.as_ref(), &query, &sync, &policy).await);
                    }
                    outcomes
                }
                .instrument(span),
            );
            handles.push(handle);
        }

        let results = join_all(handles).await;

        let mut outcomes = Vec::new();
        for (city, joined) in cities.iter().zip(results) {
            match joined {
                Ok(city_outcomes) => outcomes.extend(city_outcomes),
                Err(e) => {
                    error!(
                        city = %city.city,
                        state = %city.state,
                        error = %e,
                        "City task panicked"
                    );
                    for provider in self.providers.iter() {
                        outcomes.push(PairOutcome {
                            source: provider.source(),
                            tally: SourceTally {
                                failed_cities: 1,
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }

        outcomes
    }
}

/// Fetch -> normalize -> upsert for one city and provider. Never fails the run.
async fn ingest_city(
    provider: &dyn Provider,
    query: &LocationQuery,
    sync: &SyncEngine,
    policy: &RetryPolicy,
) -> PairOutcome {
    let source = provider.source();
    let mut tally = SourceTally::default();

    let pages = match fetch_all_pages(provider, query, policy).await {
        Ok(pages) => pages,
        Err(e) => {
            warn!(
                source,
                city = %query.city,
                state = %query.state,
                status = ?e.status_code(),
                error = %e,
                "Provider fetch failed, skipping city"
            );
            tally.failed_cities = 1;
            return PairOutcome { source, tally };
        }
    };

    tally.pages_fetched = pages.pages_fetched as u64;
    tally.rate_limit_retries = pages.rate_limit_retries as u64;
    tally.records_fetched = (pages.records.len() + pages.undecodable) as u64;

    let (events, incomplete) = normalize_batch(source, &pages.records);
    let dropped = incomplete + pages.undecodable;
    tally.records_dropped = dropped as u64;
    metrics::record_normalized(source, events.len() as u64, dropped as u64);

    if events.is_empty() {
        if tally.records_fetched > 0 {
            warn!(
                source,
                city = %query.city,
                state = %query.state,
                dropped,
                "No usable events after normalization"
            );
        }
        return PairOutcome { source, tally };
    }

    match sync
        .upsert_batch(source, &query.city, &query.state, events, Utc::now())
        .await
    {
        Ok(counts) => {
            tally.inserted = counts.inserted;
            tally.updated = counts.updated;
            info!(
                source,
                city = %query.city,
                state = %query.state,
                inserted = counts.inserted,
                updated = counts.updated,
                dropped,
                "City synced"
            );
        }
        Err(e) => {
            error!(source, city = %query.city, state = %query.state, error = %e, "Upsert failed");
            tally.failed_cities = 1;
        }
    }

    PairOutcome { source, tally }
}

fn merge(into: &mut SourceTally, from: &SourceTally) {
    into.pages_fetched += from.pages_fetched;
    into.rate_limit_retries += from.rate_limit_retries;
    into.records_fetched += from.records_fetched;
    into.records_dropped += from.records_dropped;
    into.inserted += from.inserted;
    into.updated += from.updated;
    into.failed_cities += from.failed_cities;
    into.deactivated += from.deactivated;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MeetupEvent, PageOutcome, RawPage, RawRecord};
    use crate::schemas::{ExternalEvent, StoredEvent};
    use crate::storage::{
        ActivityCounts, EventStore, MemoryEventStore, StaticCityDirectory, UpsertCounts,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    fn meetup_record(city: &str, id: &str) -> RawRecord {
        RawRecord::Meetup(MeetupEvent {
            id: Some(format!("{}-{}", city, id)),
            name: Some(format!("Event {}", id)),
            description: None,
            link: Some(format!("https://www.meetup.com/e/{}", id)),
            time: Some(1_793_916_000_000),
            duration: None,
            venue: None,
        })
    }

    fn single_page(records: Vec<RawRecord>) -> PageOutcome {
        PageOutcome::Page(RawPage {
            records,
            undecodable: 0,
            is_last_page: true,
        })
    }

    /// Returns the same single page for every city, or fails for one city
    struct StubProvider {
        source: &'static str,
        failing_city: Option<&'static str>,
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn source(&self) -> &'static str {
            self.source
        }

        fn start_page(&self) -> u32 {
            0
        }

        fn max_pages(&self) -> u32 {
            3
        }

        async fn fetch_page(&self, query: &LocationQuery, _page: u32) -> Result<PageOutcome> {
            if self.failing_city == Some(query.city.as_str()) {
                return Err(IngestionError::ApiError {
                    source_name: self.source.to_string(),
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let records = self
                .ids
                .iter()
                .map(|id| meetup_record(&query.city, id))
                .collect();
            Ok(single_page(records))
        }
    }

    /// Sleeps inside `fetch_page` and tracks how many calls overlap
    struct SlowProvider {
        delay_ms: u64,
        slow_city: Option<(&'static str, u64)>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowProvider {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                slow_city: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn source(&self) -> &'static str {
            "meetup"
        }

        fn start_page(&self) -> u32 {
            0
        }

        fn max_pages(&self) -> u32 {
            1
        }

        async fn fetch_page(&self, query: &LocationQuery, _page: u32) -> Result<PageOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = match self.slow_city {
                Some((city, ms)) if city == query.city => ms,
                _ => self.delay_ms,
            };
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(single_page(vec![meetup_record(&query.city, "1")]))
        }
    }

    fn orchestrator(
        providers: Vec<Arc<dyn Provider>>,
        cities: Vec<EnabledCity>,
        store: Arc<dyn EventStore>,
    ) -> RunOrchestrator {
        orchestrator_with_workers(providers, cities, store, 4)
    }

    fn orchestrator_with_workers(
        providers: Vec<Arc<dyn Provider>>,
        cities: Vec<EnabledCity>,
        store: Arc<dyn EventStore>,
        workers: usize,
    ) -> RunOrchestrator {
        RunOrchestrator::new(
            providers,
            Arc::new(StaticCityDirectory::new(cities)),
            Arc::new(SyncEngine::new(store, Duration::days(2))),
            RetryPolicy::immediate(),
            15,
            workers,
        )
    }

    fn texas(names: &[&str]) -> Vec<EnabledCity> {
        names.iter().map(|c| EnabledCity::new(*c, "TX")).collect()
    }

    #[tokio::test]
    async fn test_failing_city_does_not_abort_run() {
        let store = Arc::new(MemoryEventStore::new());
        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            source: "meetup",
            failing_city: Some("Dallas"),
            ids: vec!["1", "2"],
        });
        let cities = texas(&["Austin", "Dallas", "Houston"]);
        let run = orchestrator(vec![provider], cities, store.clone());

        let report = run.run("test-run").await.unwrap();

        assert_eq!(run.phase(), RunPhase::Done);
        assert_eq!(report.cities, 3);
        assert_eq!(report.events_upserted(), 4);
        assert_eq!(report.failures(), 1);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_repeated_run_is_idempotent() {
        let store = Arc::new(MemoryEventStore::new());
        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            source: "meetup",
            failing_city: None,
            ids: vec!["1", "2"],
        });
        let run = orchestrator(vec![provider], texas(&["Austin"]), store.clone());

        let first = run.run("run-1").await.unwrap();
        let second = run.run("run-2").await.unwrap();

        assert_eq!(first.sources["meetup"].inserted, 2);
        assert_eq!(second.sources["meetup"].inserted, 0);
        assert_eq!(second.sources["meetup"].updated, 2);
        assert_eq!(second.rows_deactivated(), 0);
        assert_eq!(store.len(), 2);
        assert!(store.all_rows().iter().all(|r| r.is_active));
    }

    #[tokio::test]
    async fn test_sweep_runs_once_per_source_after_upserts() {
        let store = Arc::new(MemoryEventStore::new());
        let old = ExternalEvent {
            external_id: "gone".to_string(),
            title: "Delisted".to_string(),
            description: None,
            start_time: Utc::now(),
            end_time: None,
            venue_name: None,
            external_url: "https://www.meetup.com/e/gone".to_string(),
        };
        store.insert_row(StoredEvent::first_sighting(
            "meetup",
            "Austin",
            "TX",
            &old,
            Utc::now() - Duration::days(3),
        ));

        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            source: "meetup",
            failing_city: None,
            ids: vec!["1"],
        });
        let run = orchestrator(vec![provider], texas(&["Austin"]), store.clone());

        let report = run.run("test-run").await.unwrap();

        assert_eq!(report.rows_deactivated(), 1);
        assert!(!store.get("meetup", "gone").unwrap().is_active);
        assert!(store.get("meetup", "Austin-1").unwrap().is_active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_bounds_concurrent_cities() {
        let store = Arc::new(MemoryEventStore::new());
        let provider = Arc::new(SlowProvider::new(25));
        let cities = texas(&[
            "Austin", "Dallas", "Houston", "El Paso", "Waco", "Tyler", "Laredo", "Frisco",
        ]);
        let shared: Arc<dyn Provider> = provider.clone();
        let run = orchestrator_with_workers(vec![shared], cities, store.clone(), 2);

        let report = run.run("test-run").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
        assert_eq!(report.events_upserted(), 8);
        assert_eq!(store.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_waits_for_slowest_city() {
        let store = Arc::new(MemoryEventStore::new());

        // Rows from an earlier run; every city lists its event again this run
        for city in ["Austin", "Dallas", "Houston"] {
            let event = ExternalEvent {
                external_id: format!("{}-1", city),
                title: "Event 1".to_string(),
                description: None,
                start_time: Utc::now(),
                end_time: None,
                venue_name: None,
                external_url: "https://www.meetup.com/e/1".to_string(),
            };
            store.insert_row(StoredEvent::first_sighting(
                "meetup",
                city,
                "TX",
                &event,
                Utc::now() - Duration::days(3),
            ));
        }

        let provider = Arc::new(SlowProvider {
            slow_city: Some(("Austin", 150)),
            ..SlowProvider::new(0)
        });
        let cities = texas(&["Austin", "Dallas", "Houston"]);
        let provider: Arc<dyn Provider> = provider;
        let run = orchestrator_with_workers(vec![provider], cities, store.clone(), 3);

        let report = run.run("test-run").await.unwrap();

        assert_eq!(report.rows_deactivated(), 0);
        assert!(store.all_rows().iter().all(|r| r.is_active));
        assert_eq!(report.sources["meetup"].updated, 3);
    }

    /// Notes the orchestrator's phase each time cities are read
    #[derive(Default)]
    struct PhaseRecordingCities {
        orchestrator: once_cell::sync::OnceCell<Weak<RunOrchestrator>>,
        seen: parking_lot::Mutex<Vec<RunPhase>>,
    }

    #[async_trait]
    impl CityDirectory for PhaseRecordingCities {
        async fn enabled_cities(&self) -> Result<Vec<EnabledCity>> {
            if let Some(run) = self.orchestrator.get().and_then(Weak::upgrade) {
                self.seen.lock().push(run.phase());
            }
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_each_run_starts_pending() {
        let cities = Arc::new(PhaseRecordingCities::default());
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let run = Arc::new(RunOrchestrator::new(
            vec![],
            cities.clone(),
            Arc::new(SyncEngine::new(store, Duration::days(2))),
            RetryPolicy::immediate(),
            15,
            2,
        ));
        cities.orchestrator.set(Arc::downgrade(&run)).ok();

        run.run("run-1").await.unwrap();
        assert_eq!(run.phase(), RunPhase::Done);
        run.run("run-2").await.unwrap();

        assert_eq!(*cities.seen.lock(), vec![RunPhase::Pending, RunPhase::Pending]);
    }

    struct BrokenCities;

    #[async_trait]
    impl CityDirectory for BrokenCities {
        async fn enabled_cities(&self) -> Result<Vec<EnabledCity>> {
            Err(IngestionError::StorageError("city table unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unreadable_city_list_fails_run() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let run = RunOrchestrator::new(
            vec![],
            Arc::new(BrokenCities),
            Arc::new(SyncEngine::new(store, Duration::days(2))),
            RetryPolicy::immediate(),
            15,
            2,
        );

        assert!(run.run("test-run").await.is_err());
        assert_eq!(run.phase(), RunPhase::Failed);
    }

    /// Accepts upserts but refuses to sweep
    struct SweepFailsStore(MemoryEventStore);

    #[async_trait]
    impl EventStore for SweepFailsStore {
        async fn upsert_events(
            &self,
            source: &str,
            city: &str,
            state: &str,
            events: &[ExternalEvent],
            now: DateTime<Utc>,
        ) -> Result<UpsertCounts> {
            self.0.upsert_events(source, city, state, events, now).await
        }

        async fn deactivate_stale(&self, _source: &str, _cutoff: DateTime<Utc>) -> Result<u64> {
            Err(IngestionError::StorageError("write failed".to_string()))
        }

        async fn count_by_activity(&self, source: &str) -> Result<ActivityCounts> {
            self.0.count_by_activity(source).await
        }
    }

    #[tokio::test]
    async fn test_sweep_failure_fails_run_but_keeps_upserts() {
        let store = Arc::new(SweepFailsStore(MemoryEventStore::new()));
        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            source: "meetup",
            failing_city: None,
            ids: vec!["1", "2"],
        });
        let run = orchestrator(vec![provider], texas(&["Austin"]), store.clone());

        let err = run.run("test-run").await.unwrap_err();

        assert!(matches!(err, IngestionError::StorageError(_)));
        assert_eq!(run.phase(), RunPhase::Failed);
        assert_eq!(store.0.len(), 2);
    }

    #[tokio::test]
    async fn test_no_cities_still_sweeps() {
        let store = Arc::new(MemoryEventStore::new());
        let provider: Arc<dyn Provider> = Arc::new(StubProvider {
            source: "meetup",
            failing_city: None,
            ids: vec![],
        });
        let run = orchestrator(vec![provider], vec![], store);

        let report = run.run("test-run").await.unwrap();
        assert_eq!(report.cities, 0);
        assert!(report.sources.contains_key("meetup"));
        assert_eq!(run.phase(), RunPhase::Done);
    }
}
