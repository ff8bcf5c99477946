//! Community events ingestion
//!
//! Pulls event listings for every enabled city from Ticketmaster, Eventbrite
//! and Meetup, normalizes them into `ExternalEvent`, upserts them keyed by
//! `(source, external_event_id)` and retires listings a source stopped
//! returning.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod normalizer;
pub mod orchestrator;
pub mod pagination;
pub mod providers;
pub mod schemas;
pub mod storage;
pub mod sync;

pub use error::{IngestionError, Result};
