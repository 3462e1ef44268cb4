//! One ingestion run: fetch a day's racecards and results for a set of
//! regions and upsert everything into the store.
//!
//! The run moves through `FetchRacecards -> FetchResults -> Persist -> Report`.
//! All writes for the run share one transaction. If cancellation is seen
//! before commit the transaction is dropped (rolled back) and the call
//! returns [`IngestError::Cancelled`]; nothing partial is ever committed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RacingApiClient;
use crate::error::{IngestError, Result};
use crate::extract::{extract_list, extract_meeting, extract_results, ExtractContext, Extracted, StructuredRow};
use crate::store::{persist, Store};

/// Recorded in the report when the results fetch is rejected for plan
/// reasons (error text mentioning "plan" with "standard" or "basic"); the
/// run then continues with racecards only.
pub const RESULTS_PLAN_MESSAGE: &str =
    "Results endpoint unavailable on current plan; ingesting racecards only.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub date: NaiveDate,
    pub regions: Vec<String>,
    /// Use the cheaper racecard-summaries endpoint.
    pub minimal_payload: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounts {
    pub meetings: u64,
    pub races: u64,
    pub runners: u64,
    pub results: u64,
    pub entities: u64,
    pub facts: u64,
}

impl IngestCounts {
    fn record(&mut self, item: &Extracted, facts: usize) {
        match item.row {
            Some(StructuredRow::Meeting(_)) => self.meetings += 1,
            Some(StructuredRow::Race(_)) => self.races += 1,
            Some(StructuredRow::Runner(_)) => self.runners += 1,
            Some(StructuredRow::Result(_)) => self.results += 1,
            None => {}
        }
        self.entities += 1;
        self.facts += facts as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub date: NaiveDate,
    pub regions: Vec<String>,
    pub counts: IngestCounts,
    /// Soft failures that did not stop the run.
    pub errors: Vec<String>,
}

/// Milestones reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AuthCheck,
    Discover,
    FetchRacecards,
    FetchResults,
    Persist,
    Report,
}

impl Stage {
    pub fn percent(self) -> u8 {
        match self {
            Stage::AuthCheck => 10,
            Stage::Discover => 20,
            Stage::FetchRacecards => 45,
            Stage::FetchResults => 65,
            Stage::Persist => 90,
            Stage::Report => 100,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::AuthCheck => "Auth check",
            Stage::Discover => "Discover",
            Stage::FetchRacecards => "Fetch racecards",
            Stage::FetchResults => "Fetch results",
            Stage::Persist => "Write DB",
            Stage::Report => "Report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub percent: u8,
}

/// Fire-and-forget progress sink.
///
/// Updates go through `try_send`: when the receiver is slow and the channel
/// is full, or the receiver is gone, the update is dropped.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<Progress>>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<Progress>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    fn report(&self, stage: Stage) {
        self.send(stage, stage.percent());
    }

    /// Intermediate update while persisting: `done` of `total` meetings,
    /// spread between the results and persist milestones.
    fn report_meetings(&self, done: usize, total: usize) {
        let floor = Stage::FetchResults.percent();
        let span = (Stage::Persist.percent() - floor - 1) as usize;
        let percent = floor + (span * done / total.max(1)) as u8;
        self.send(Stage::Persist, percent);
    }

    fn send(&self, stage: Stage, percent: u8) {
        debug!("Progress: {} ({}%)", stage.label(), percent);
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(Progress { stage, percent });
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    Ok(())
}

/// Ingest one date for a set of regions.
///
/// On success the report is also written to
/// `<report_dir>/ingest_report_<date>.json`.
pub async fn ingest_day(
    client: &RacingApiClient,
    store: &Store,
    request: &IngestRequest,
    report_dir: &Path,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<IngestReport> {
    let date = request.date;
    let regions = request.regions.as_slice();
    info!("Ingesting {} for regions {:?}", date, regions);

    let mut report = IngestReport {
        date,
        regions: request.regions.clone(),
        counts: IngestCounts::default(),
        errors: Vec::new(),
    };

    progress.report(Stage::AuthCheck);
    progress.report(Stage::Discover);

    // FetchRacecards
    ensure_live(cancel)?;
    let racecards = if request.minimal_payload {
        client.fetch_racecard_summaries_or_full(date, regions, cancel).await?
    } else {
        client.fetch_racecards(date, regions, cancel).await?
    };
    progress.report(Stage::FetchRacecards);

    // FetchResults
    ensure_live(cancel)?;
    let results = match client.fetch_results(date, regions, cancel).await {
        Ok(value) => value,
        Err(e) if e.is_plan_restriction() => {
            warn!("Results fetch soft-failed: {}", e);
            report.errors.push(RESULTS_PLAN_MESSAGE.to_string());
            json!({ "results": [] })
        }
        Err(e) => return Err(e),
    };
    progress.report(Stage::FetchResults);

    // Persist
    ensure_live(cancel)?;
    persist_all(store, &racecards, &results, request, cancel, progress, &mut report).await?;
    progress.report(Stage::Persist);

    // Report
    let path = write_report(report_dir, &report).await?;
    info!(
        "Ingested {}: {} meetings, {} races, {} runners, {} results, {} entities, {} facts ({})",
        date,
        report.counts.meetings,
        report.counts.races,
        report.counts.runners,
        report.counts.results,
        report.counts.entities,
        report.counts.facts,
        path.display()
    );
    progress.report(Stage::Report);
    Ok(report)
}

async fn persist_all(
    store: &Store,
    racecards: &Value,
    results: &Value,
    request: &IngestRequest,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
    report: &mut IngestReport,
) -> Result<()> {
    let ctx = ExtractContext {
        date: request.date,
        regions: &request.regions,
    };
    let mut tx = store.begin().await?;

    let meetings = extract_list(racecards);
    let total = meetings.len();
    for (index, meeting) in meetings.into_iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("Cancelled after {} of {} meetings; rolling back", index, total);
            return Err(IngestError::Cancelled);
        }
        for item in extract_meeting(meeting, index, &ctx) {
            let facts = persist(&mut tx, &item).await?;
            report.counts.record(&item, facts);
        }
        progress.report_meetings(index + 1, total);
    }

    ensure_live(cancel)?;
    for item in extract_results(results, &ctx) {
        let facts = persist(&mut tx, &item).await?;
        report.counts.record(&item, facts);
    }

    ensure_live(cancel)?;
    tx.commit().await?;
    Ok(())
}

pub fn report_path(report_dir: &Path, date: NaiveDate) -> PathBuf {
    report_dir.join(format!("ingest_report_{}.json", date.format("%Y-%m-%d")))
}

async fn write_report(report_dir: &Path, report: &IngestReport) -> Result<PathBuf> {
    tokio::fs::create_dir_all(report_dir).await?;
    let path = report_path(report_dir, report.date);
    let body = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_percentages_never_decrease() {
        let stages = [
            Stage::AuthCheck,
            Stage::Discover,
            Stage::FetchRacecards,
            Stage::FetchResults,
            Stage::Persist,
            Stage::Report,
        ];
        assert!(stages.windows(2).all(|w| w[0].percent() <= w[1].percent()));
        assert_eq!(Stage::Report.percent(), 100);
    }

    #[test]
    fn full_channel_drops_updates() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new(tx);
        reporter.report(Stage::AuthCheck);
        reporter.report(Stage::Discover);
        assert_eq!(rx.try_recv().unwrap().stage, Stage::AuthCheck);
        assert!(rx.try_recv().is_err());

        drop(rx);
        reporter.report(Stage::Report);
    }

    #[test]
    fn meeting_updates_stay_between_milestones() {
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = ProgressReporter::new(tx);
        reporter.report(Stage::FetchResults);
        for done in 1..=3 {
            reporter.report_meetings(done, 3);
        }
        reporter.report(Stage::Persist);

        let mut percents = Vec::new();
        while let Ok(update) = rx.try_recv() {
            percents.push(update.percent);
        }
        assert_eq!(percents, vec![65, 73, 81, 89, 90]);
    }

    #[test]
    fn report_file_name() {
        let path = report_path(Path::new("out"), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(path, Path::new("out/ingest_report_2025-01-01.json"));
    }
}
