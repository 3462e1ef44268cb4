//! Health endpoint state shared between the ingestion loop and axum.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ingest::IngestCounts;

/// Consecutive failed runs before the service reports itself degraded.
const DEGRADED_AFTER: usize = 5;
/// Consecutive failed runs before `/health` answers 503.
const UNAVAILABLE_AFTER: usize = 10;

/// Service health state
#[derive(Clone, Default)]
pub struct HealthState {
    pub last_run_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    pub last_run_counts: Arc<RwLock<Option<IngestCounts>>>,
    pub error_count: Arc<RwLock<usize>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, counts: IngestCounts) {
        *self.last_run_time.write().await = Some(Utc::now());
        *self.last_run_counts.write().await = Some(counts);
        *self.error_count.write().await = 0;
    }

    pub async fn record_error(&self) {
        *self.error_count.write().await += 1;
    }
}

pub fn router(health: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(health)
}

/// Health check handler
pub async fn health_handler(
    State(health): State<HealthState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let last_run = health.last_run_time.read().await;
    let last_counts = health.last_run_counts.read().await;
    let errors = health.error_count.read().await;

    let status = if *errors > DEGRADED_AFTER { "degraded" } else { "ok" };

    let http_status = if *errors > UNAVAILABLE_AFTER {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "racing-ingestion",
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
            "last_run": last_run.map(|t| t.to_rfc3339()),
            "last_run_counts": *last_counts,
            "consecutive_errors": *errors
        })),
    )
}
