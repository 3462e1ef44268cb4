//! Horse-racing ingestion core.
//!
//! Pulls a day's racecards and results from The Racing API and normalizes them
//! into structured tables plus an entity/key-value store, idempotently.

pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod flatten;
pub mod health;
pub mod ingest;
pub mod probe;
pub mod store;

pub use client::{ClientSettings, Endpoint, Pacer, RacingApiClient};
pub use config::Config;
pub use error::{IngestError, Result};
pub use flatten::{flatten_json, unflatten, FactValue};
pub use ingest::{ingest_day, IngestCounts, IngestReport, IngestRequest, Progress, ProgressReporter, Stage};
pub use probe::{probe_capabilities, CapabilityReport};
pub use store::Store;
