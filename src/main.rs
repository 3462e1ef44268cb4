//! Racing ingestion service.
//!
//! Ingests a day's racecards and results from The Racing API into SQLite,
//! either once (`RUN_ONCE=true`) or on a polling interval. Re-ingesting the
//! same day converges, so polling keeps the store current without duplicates.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use racing_ingestion::config::{self, Config};
use racing_ingestion::health::{self, HealthState};
use racing_ingestion::{
    ingest_day, probe_capabilities, IngestError, IngestReport, IngestRequest, Progress,
    ProgressReporter, RacingApiClient, Store,
};

struct Service {
    config: Config,
    client: RacingApiClient,
    store: Store,
    health: HealthState,
}

impl Service {
    async fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open store at {}", config.database_path.display()))?;
        let client =
            RacingApiClient::new(config.client_settings()).context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            client,
            store,
            health: HealthState::new(),
        })
    }

    /// Single ingestion for the configured (or current) date
    async fn run_once(&self, cancel: &CancellationToken) -> std::result::Result<IngestReport, IngestError> {
        let request = IngestRequest {
            date: self.config.effective_date(),
            regions: self.config.regions.clone(),
            minimal_payload: self.config.minimal_payload,
        };

        let (tx, rx) = mpsc::channel(16);
        let logger = tokio::spawn(log_progress(rx));
        let result = ingest_day(
            &self.client,
            &self.store,
            &request,
            &self.config.report_dir,
            cancel,
            &ProgressReporter::new(tx),
        )
        .await;
        let _ = logger.await;

        match &result {
            Ok(report) => {
                self.health.record_success(report.counts.clone()).await;
                for message in &report.errors {
                    warn!("{}", message);
                }
            }
            Err(IngestError::Cancelled) => {}
            Err(_) => self.health.record_error().await,
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken) {
        info!(
            "Starting ingestion loop (poll interval: {}s)",
            self.config.poll_interval_seconds
        );

        loop {
            let start = std::time::Instant::now();
            match self.run_once(cancel).await {
                Ok(report) => info!(
                    "Poll completed: {} runners for {} in {:?}",
                    report.counts.runners,
                    report.date,
                    start.elapsed()
                ),
                Err(IngestError::Cancelled) => return,
                Err(e) => error!("Poll failed: {:?}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

async fn log_progress(mut rx: mpsc::Receiver<Progress>) {
    while let Some(update) = rx.recv().await {
        info!("[{:>3}%] {}", update.percent, update.stage.label());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("racing_ingestion=info".parse()?),
        )
        .init();

    info!("Racing Ingestion Service v{}", env!("CARGO_PKG_VERSION"));
    for (key, configured) in config::secret_status() {
        info!("{}: {}", key, if configured { "configured" } else { "missing" });
    }

    let config = Config::from_env()?;
    let health_port = config.health_port;
    let run_once = config.run_once;
    let report_dir: PathBuf = config.report_dir.clone();

    let service = Service::new(config).await?;
    let cancel = CancellationToken::new();

    // Start health check server
    let health_addr = format!("0.0.0.0:{}", health_port);
    let listener = tokio::net::TcpListener::bind(&health_addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {health_addr}"))?;
    info!("Health endpoint listening on {}", health_addr);
    let app = health::router(service.health.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Health server stopped: {}", e);
        }
    });

    // Ctrl-C cancels any in-flight ingestion at its next check
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    let capabilities = probe_capabilities(
        &service.client,
        service.config.effective_date(),
        &service.config.regions,
        &cancel,
    )
    .await;
    match capabilities {
        Ok(caps) if caps.auth_ok => info!("Plan: {}", caps.plan_message),
        Ok(caps) => warn!("Plan: {}", caps.plan_message),
        Err(IngestError::Cancelled) => return Ok(()),
        Err(e) => warn!("Capability probe failed: {}", e),
    }

    if run_once {
        info!("Running in one-shot mode (RUN_ONCE=true)");
        match service.run_once(&cancel).await {
            Ok(report) => {
                info!(
                    "One-shot ingestion completed; report in {}",
                    report_dir.display()
                );
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(IngestError::Cancelled) => info!("One-shot ingestion cancelled"),
            Err(e) => {
                error!("One-shot ingestion failed: {:?}", e);
                return Err(e.into());
            }
        }
        return Ok(());
    }

    service.run(&cancel).await;
    Ok(())
}
