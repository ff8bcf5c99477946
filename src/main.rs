//! Community Events Ingestion
//! Pulls third-party event listings per enabled city and syncs them into the event store
//!
//! Features:
//! - Ticketmaster, Eventbrite and Meetup providers
//! - Per-provider token-bucket rate limiting and circuit breakers
//! - 429 backoff that retries the same page
//! - Idempotent upserts keyed by (source, external id)
//! - Staleness sweep retiring listings a source stopped returning
//! - Bounded city worker pool with per-city failure isolation
//! - Correlation IDs (run ids) on every log line of a run
//! - Prometheus counters per stage

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use events_ingestion::config::Config;
use events_ingestion::error::IngestionError;
use events_ingestion::http_client::{HttpClientConfig, ResilientHttpClient};
use events_ingestion::metrics::gather_metrics;
use events_ingestion::normalizer::normalize_batch;
use events_ingestion::orchestrator::RunOrchestrator;
use events_ingestion::pagination::{fetch_all_pages, RetryPolicy};
use events_ingestion::providers::{build_providers, eventbrite, meetup, ticketmaster, Provider};
use events_ingestion::schemas::{EnabledCity, LocationQuery};
use events_ingestion::storage::{
    postgres, EventStore, MemoryEventStore, PgCityDirectory, PgEventStore,
};
use events_ingestion::sync::SyncEngine;

const KNOWN_SOURCES: [&str; 3] = [ticketmaster::SOURCE, eventbrite::SOURCE, meetup::SOURCE];

/// Community Events Ingestion - external event listing sync
#[derive(Parser, Debug)]
#[command(name = "events-ingestion")]
#[command(author = "Community Events Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pulls external event listings per city and syncs them into the event store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline once for every enabled city
    Run {
        /// Print Prometheus metrics when the run finishes
        #[arg(long, default_value = "false")]
        print_metrics: bool,
    },

    /// Fetch and normalize one city from one provider without writing anything
    Fetch {
        /// Provider to fetch from (ticketmaster, eventbrite, meetup)
        #[arg(short, long)]
        provider: String,

        /// City name, e.g. "Austin"
        #[arg(short, long)]
        city: String,

        /// Two-letter state code, e.g. "TX"
        #[arg(short, long)]
        state: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "summary")]
        output: OutputFormat,
    },

    /// Run only the staleness sweep
    Sweep {
        /// Source to sweep (defaults to every known source)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Show configured providers, settings and stored row counts
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

/// Generates a new correlation ID for the run
fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    let correlation_id = generate_correlation_id();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        correlation_id = %correlation_id,
        "Starting Community Events Ingestion"
    );

    let config = Config::load()?;
    config.validate()?;

    info!(
        ticketmaster = config.has_ticketmaster(),
        eventbrite = config.has_eventbrite(),
        meetup = config.has_meetup(),
        workers = config.events_workers,
        stale_days = config.events_stale_days,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Run { print_metrics } => {
            run_once(config, &correlation_id, print_metrics).await?;
        }

        Commands::Fetch { provider, city, state, output } => {
            fetch_city(config, &provider, EnabledCity::new(city, state), output).await?;
        }

        Commands::Sweep { source } => {
            sweep(config, source.as_deref()).await?;
        }

        Commands::Status => {
            show_status(config).await?;
        }
    }

    Ok(())
}

fn http_client(config: &Config) -> Result<Arc<ResilientHttpClient>> {
    let http = ResilientHttpClient::new(HttpClientConfig {
        max_concurrent_requests: config.max_concurrent_requests,
        request_timeout: config.request_timeout(),
        ..Default::default()
    })?;
    Ok(Arc::new(http))
}

async fn connect_store(config: &Config) -> Result<(PgEventStore, sqlx::PgPool)> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let pool = postgres::connect(database_url, config.database_max_connections).await?;
    let store = PgEventStore::new(pool.clone());
    store.ensure_schema().await?;
    Ok((store, pool))
}

/// Runs one full ingestion pass
async fn run_once(config: Config, correlation_id: &str, print_metrics: bool) -> Result<()> {
    let providers = build_providers(&config, http_client(&config)?);
    if providers.is_empty() {
        bail!(
            "No providers configured \
             (set TICKETMASTER_API_KEY, EVENTBRITE_TOKEN or MEETUP_API_KEY)"
        );
    }

    let (store, pool) = connect_store(&config).await?;
    let sync = Arc::new(SyncEngine::new(Arc::new(store), config.stale_window()));

    let orchestrator = RunOrchestrator::new(
        providers,
        Arc::new(PgCityDirectory::new(pool)),
        sync,
        RetryPolicy::from_config(&config),
        config.events_radius_miles,
        config.events_workers,
    );

    let report = match orchestrator.run(correlation_id).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, phase = ?orchestrator.phase(), "Ingestion run failed");
            return Err(e.into());
        }
    };

    println!("\nIngestion Run {}", report.run_id);
    println!("=====================================================");
    println!("Cities: {}", report.cities);
    println!(
        "Duration: {:.1}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    println!(
        "\n{:<14} {:>7} {:>8} {:>8} {:>9} {:>8} {:>12} {:>9}",
        "Source", "Pages", "Fetched", "Dropped", "Inserted", "Updated", "Deactivated", "Failures"
    );
    println!("{}", "-".repeat(82));
    for (source, tally) in &report.sources {
        println!(
            "{:<14} {:>7} {:>8} {:>8} {:>9} {:>8} {:>12} {:>9}",
            source,
            tally.pages_fetched,
            tally.records_fetched,
            tally.records_dropped,
            tally.inserted,
            tally.updated,
            tally.deactivated,
            tally.failed_cities
        );
    }
    println!(
        "\nTotal upserted: {}, deactivated: {}",
        report.events_upserted(),
        report.rows_deactivated()
    );

    if print_metrics {
        println!("\n{}", gather_metrics());
    }

    Ok(())
}

fn provider_by_name(config: &Config, name: &str) -> Result<Arc<dyn Provider>> {
    if !KNOWN_SOURCES.contains(&name) {
        bail!("Unknown provider '{}' (expected one of: {})", name, KNOWN_SOURCES.join(", "));
    }

    let provider = build_providers(config, http_client(config)?)
        .into_iter()
        .find(|p| p.source() == name)
        .ok_or_else(|| IngestionError::ProviderNotConfigured(name.to_string()))?;
    Ok(provider)
}

/// Fetches and normalizes one city; nothing is persisted
async fn fetch_city(
    config: Config,
    provider: &str,
    city: EnabledCity,
    output: OutputFormat,
) -> Result<()> {
    let provider = provider_by_name(&config, provider)?;
    let query = LocationQuery::for_city(&city, config.events_radius_miles);

    info!(source = provider.source(), city = %city, "Fetching");

    let policy = RetryPolicy::from_config(&config);
    let pages = fetch_all_pages(provider.as_ref(), &query, &policy).await?;
    let (events, incomplete) = normalize_batch(provider.source(), &pages.records);
    let dropped = incomplete + pages.undecodable;

    // Dry-run the sync against a scratch store to report what a real run would write
    let scratch = Arc::new(MemoryEventStore::new());
    let sync = SyncEngine::new(scratch.clone(), config.stale_window());
    let counts = sync
        .upsert_batch(provider.source(), &city.city, &city.state, events.clone(), Utc::now())
        .await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        OutputFormat::Summary => {
            println!("\nFetch Summary");
            println!("=============");
            println!("Provider: {}", provider.source());
            println!("City:     {}", city);
            println!("Pages:    {}", pages.pages_fetched);
            println!("Raw:      {}", pages.records.len() + pages.undecodable);
            println!("Kept:     {}", events.len());
            println!("Dropped:  {}", dropped);
            println!("Unique:   {}", counts.total());
            if pages.rate_limit_retries > 0 {
                println!("429 retries: {}", pages.rate_limit_retries);
            }

            let mut rows = scratch.all_rows();
            rows.sort_by_key(|r| r.start_time);
            for row in rows.iter().take(10) {
                println!(
                    "  {} | {} | {}",
                    row.start_time.format("%Y-%m-%d %H:%M"),
                    row.title,
                    row.venue_name.as_deref().unwrap_or("-")
                );
            }
            if rows.len() > 10 {
                println!("  ... and {} more", rows.len() - 10);
            }
        }
    }

    Ok(())
}

/// Runs the staleness sweep without fetching
async fn sweep(config: Config, source: Option<&str>) -> Result<()> {
    let sources: Vec<&str> = match source {
        Some(s) if KNOWN_SOURCES.contains(&s) => vec![s],
        Some(s) => bail!("Unknown source '{}' (expected one of: {})", s, KNOWN_SOURCES.join(", ")),
        None => KNOWN_SOURCES.to_vec(),
    };

    let (store, _) = connect_store(&config).await?;
    let sync = SyncEngine::new(Arc::new(store), config.stale_window());
    let now = Utc::now();

    let mut failed = false;
    for source in sources {
        match sync.sweep_stale(source, now).await {
            Ok(count) => println!("{}: {} rows deactivated", source, count),
            Err(e) => {
                warn!(source, error = %e, "Sweep failed");
                failed = true;
            }
        }
    }

    if failed {
        bail!("Staleness sweep failed for at least one source");
    }
    Ok(())
}

/// Shows configured providers, settings and row counts
async fn show_status(config: Config) -> Result<()> {
    let mark = |on: bool| if on { "configured" } else { "disabled (no credentials)" };

    println!("\nCommunity Events Ingestion Status");
    println!("=================================\n");

    println!("Providers:");
    println!(
        "  - Ticketmaster: {} (max {} pages, {} rpm)",
        mark(config.has_ticketmaster()),
        config.ticketmaster_max_pages,
        config.ticketmaster_rate_limit_rpm
    );
    println!(
        "  - Eventbrite:   {} (max {} pages, {} rpm)",
        mark(config.has_eventbrite()),
        config.eventbrite_max_pages,
        config.eventbrite_rate_limit_rpm
    );
    println!(
        "  - Meetup:       {} (max {} pages, {} rpm)",
        mark(config.has_meetup()),
        config.meetup_max_pages,
        config.meetup_rate_limit_rpm
    );

    println!("\nSettings:");
    println!("  Radius:      {} miles", config.events_radius_miles);
    println!("  Stale after: {} days", config.events_stale_days);
    println!("  Workers:     {}", config.events_workers);
    println!(
        "  429 backoff: {} ms x {} retries",
        config.rate_limit_backoff_ms, config.rate_limit_max_retries
    );

    if config.database_url.is_none() {
        println!("\nStore: DATABASE_URL not set");
        return Ok(());
    }

    let (store, _) = connect_store(&config).await?;

    println!("\nStored events:");
    for source in KNOWN_SOURCES {
        let counts = store.count_by_activity(source).await?;
        println!("  - {}: {} active, {} inactive", source, counts.active, counts.inactive);
    }

    Ok(())
}
