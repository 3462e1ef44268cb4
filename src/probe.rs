//! Preflight check of what the caller's credentials and plan allow.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{truncate, RacingApiClient};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub auth_ok: bool,
    pub can_racecards: bool,
    pub plan_message: String,
    pub rate_limit_rps: f64,
    pub available_regions: Vec<String>,
    pub blocked_regions: Vec<String>,
}

/// Check credentials with a results request, then try racecard summaries
/// region by region.
///
/// Upstream failures are folded into the report. Only cancellation is
/// returned as an error.
pub async fn probe_capabilities(
    client: &RacingApiClient,
    date: NaiveDate,
    regions: &[String],
    cancel: &CancellationToken,
) -> Result<CapabilityReport> {
    let rps = client.settings().rate_limit_rps;
    let mut report = CapabilityReport {
        rate_limit_rps: rps,
        ..CapabilityReport::default()
    };

    match client.fetch_results(date, regions, cancel).await {
        Ok(_) => report.auth_ok = true,
        Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
        Err(e) => {
            warn!("Capability probe: results request failed: {}", e);
            report.plan_message = capability_message(&e.to_string(), rps);
            return Ok(report);
        }
    }

    for region in regions {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        match client
            .fetch_racecard_summaries(date, std::slice::from_ref(region), cancel)
            .await
        {
            Ok(_) => report.available_regions.push(region.clone()),
            Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
            Err(e) => {
                report.blocked_regions.push(region.clone());
                let message = capability_message(&e.to_string(), rps);
                if !message.is_empty() && report.plan_message.is_empty() {
                    report.plan_message = message;
                }
            }
        }
    }

    report.can_racecards = !report.available_regions.is_empty();
    if !report.blocked_regions.is_empty() && report.plan_message.is_empty() {
        report.plan_message = format!(
            "Plan limits racecards for: {}",
            report.blocked_regions.join(", ")
        );
    }
    if report.can_racecards && report.plan_message.is_empty() {
        report.plan_message = "Racecard summary access available.".to_string();
    }

    info!(
        "Capabilities: auth_ok={} available={:?} blocked={:?}",
        report.auth_ok, report.available_regions, report.blocked_regions
    );
    Ok(report)
}

/// Turn raw upstream error text into something a user can act on.
pub fn capability_message(text: &str, rate_limit_rps: f64) -> String {
    let lower = text.to_lowercase();
    if lower.contains("plan") {
        if lower.contains("basic") {
            return "Basic plan restriction detected for this endpoint.".to_string();
        }
        if lower.contains("standard") {
            return "Standard plan restriction detected for this endpoint.".to_string();
        }
        return "Plan restriction detected for this endpoint.".to_string();
    }
    if lower.contains("forbidden")
        || lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("403")
    {
        return "Authentication failed. Check API credentials.".to_string();
    }
    if (lower.contains("rate") && lower.contains("limit")) || lower.contains("429") {
        return format!(
            "Rate-limited by API. Throttling is active at {rate_limit_rps} requests/sec."
        );
    }
    truncate(text, 200)
}
