//! Rate-limited, retrying client for The Racing API.
//!
//! Every attempt (retries included) waits on a [`Pacer`] first. Waiting is
//! done in short slices so a fired [`CancellationToken`] is noticed within
//! [`SLEEP_SLICE`], not after the whole remaining delay.

use chrono::NaiveDate;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

/// Upper bound on any single uninterruptible sleep.
pub const SLEEP_SLICE: Duration = Duration::from_millis(200);

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Upstream operations the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Racecards,
    RacecardSummaries,
    Results,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Racecards => "racecards",
            Endpoint::RacecardSummaries => "racecards/summaries",
            Endpoint::Results => "results",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub rate_limit_rps: f64,
    /// Spacing between requests never drops below this, whatever the rps.
    pub min_interval_floor: Duration,
    pub backoff_base: Duration,
    pub jitter_max: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.theracingapi.com/v1".to_string(),
            username: String::new(),
            password: String::new(),
            api_key: None,
            max_retries: 4,
            rate_limit_rps: 2.0,
            min_interval_floor: Duration::from_millis(550),
            backoff_base: Duration::from_secs(1),
            jitter_max: Duration::from_millis(400),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientSettings {
    pub fn min_request_interval(&self) -> Duration {
        let per_request = 1.0 / self.rate_limit_rps.max(0.1);
        let derived = Duration::try_from_secs_f64(per_request).unwrap_or(Duration::ZERO);
        derived.max(self.min_interval_floor)
    }
}

/// Request spacing shared by one or more clients.
///
/// A one-cell quota per interval: each attempt takes the cell, the next one
/// waits until it has replenished.
pub struct Pacer {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
        Self {
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next send slot, giving up as soon as `cancel` fires.
    pub async fn until_ready(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            match self.limiter.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    sleep_with_cancel(wait.max(Duration::from_millis(1)), cancel).await?;
                }
            }
        }
    }
}

/// Sleep for `duration` in slices of at most [`SLEEP_SLICE`], checking the
/// token before each slice.
pub async fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let step = remaining.min(SLEEP_SLICE);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    Ok(())
}

enum AttemptError {
    Retryable { status: Option<u16>, message: String },
    Fatal(IngestError),
}

pub struct RacingApiClient {
    http: reqwest::Client,
    settings: ClientSettings,
    pacer: Arc<Pacer>,
}

impl RacingApiClient {
    /// Client with its own pacing budget.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let pacer = Arc::new(Pacer::new(settings.min_request_interval()));
        Self::with_pacer(settings, pacer)
    }

    /// Client drawing from a budget shared with other clients.
    pub fn with_pacer(settings: ClientSettings, pacer: Arc<Pacer>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(5)
            .build()?;

        info!(
            "Racing API client ready ({}; min interval {:?}, max retries {})",
            settings.base_url,
            pacer.interval(),
            settings.max_retries
        );

        Ok(Self {
            http,
            settings,
            pacer,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn fetch_racecards(
        &self,
        date: NaiveDate,
        regions: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.fetch(Endpoint::Racecards, date, regions, cancel).await
    }

    pub async fn fetch_racecard_summaries(
        &self,
        date: NaiveDate,
        regions: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.fetch(Endpoint::RacecardSummaries, date, regions, cancel)
            .await
    }

    /// Summaries when the plan allows them, full racecards otherwise.
    pub async fn fetch_racecard_summaries_or_full(
        &self,
        date: NaiveDate,
        regions: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match self.fetch_racecard_summaries(date, regions, cancel).await {
            Ok(value) => Ok(value),
            Err(IngestError::Cancelled) => Err(IngestError::Cancelled),
            Err(e) => {
                warn!("Racecard summaries unavailable ({}); falling back to full racecards", e);
                self.fetch_racecards(date, regions, cancel).await
            }
        }
    }

    pub async fn fetch_results(
        &self,
        date: NaiveDate,
        regions: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.fetch(Endpoint::Results, date, regions, cancel).await
    }

    /// GET one endpoint for a date and region set, with pacing and retries.
    pub async fn fetch(
        &self,
        endpoint: Endpoint,
        date: NaiveDate,
        regions: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let url = format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            endpoint.path()
        );
        let query = [
            ("date", date.format("%Y-%m-%d").to_string()),
            ("country", regions.join(",")),
        ];

        let max_attempts = self.settings.max_retries + 1;
        let mut backoff = self.settings.backoff_base;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            self.pacer.until_ready(cancel).await?;

            debug!("GET {} (attempt {}/{})", url, attempt, max_attempts);
            let (status, message) = match self.send_once(&url, &query).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable { status, message }) => (status, message),
            };

            if attempt >= max_attempts {
                return Err(IngestError::TransientUpstream {
                    status,
                    attempts: attempt,
                    message,
                });
            }

            let delay = backoff + jitter(self.settings.jitter_max);
            warn!(
                "{} attempt {} failed (status {:?}); retrying in {:?}",
                endpoint.path(),
                attempt,
                status,
                delay
            );
            sleep_with_cancel(delay, cancel).await?;
            backoff = backoff.saturating_mul(2);
        }
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Value, AttemptError> {
        let mut request = self
            .http
            .get(url)
            .query(query)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header(ACCEPT, "application/json");
        if let Some(key) = &self.settings.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                AttemptError::Fatal(IngestError::MalformedPayload(format!(
                    "{url}: invalid JSON body: {e}"
                )))
            });
        }

        let code = status.as_u16();
        if RETRYABLE_STATUSES.contains(&code) {
            Err(AttemptError::Retryable {
                status: Some(code),
                message: truncate(&body, 200),
            })
        } else {
            Err(AttemptError::Fatal(IngestError::from_rejection(code, body)))
        }
    }
}

/// Connection-level failures (refused, reset, closed mid-response, timed out)
/// are retried. Builder, redirect and decode errors are not.
fn transport_error(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        AttemptError::Retryable {
            status: None,
            message: e.to_string(),
        }
    } else {
        AttemptError::Fatal(IngestError::Transport(e))
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn fast_settings(base_url: String, max_retries: u32) -> ClientSettings {
        ClientSettings {
            base_url,
            username: "u".to_string(),
            password: "p".to_string(),
            max_retries,
            rate_limit_rps: 1000.0,
            min_interval_floor: Duration::ZERO,
            backoff_base: Duration::from_millis(10),
            jitter_max: Duration::ZERO,
            ..ClientSettings::default()
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 15).unwrap()
    }

    fn regions() -> Vec<String> {
        vec!["gb".to_string(), "ire".to_string()]
    }

    #[test]
    fn min_interval_respects_floor() {
        let settings = ClientSettings::default();
        assert_eq!(settings.min_request_interval(), Duration::from_millis(550));

        let slow = ClientSettings {
            rate_limit_rps: 0.5,
            ..ClientSettings::default()
        };
        assert_eq!(slow.min_request_interval(), Duration::from_secs(2));

        let broken = ClientSettings {
            rate_limit_rps: 0.0,
            ..ClientSettings::default()
        };
        assert_eq!(broken.min_request_interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sends_auth_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/racecards"))
            .and(query_param("date", "2026-02-15"))
            .and(query_param("country", "gb,ire"))
            .and(header("authorization", "Basic dTpw"))
            .and(header("x-api-key", "key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut settings = fast_settings(server.uri(), 0);
        settings.api_key = Some("key-1".to_string());
        let client = RacingApiClient::new(settings).unwrap();
        let body = client
            .fetch_racecards(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"data": []}));
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})))
            .mount(&server)
            .await;

        let client = RacingApiClient::new(fast_settings(server.uri(), 3)).unwrap();
        let result = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await;
        tokio_test::assert_ok!(result);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"results": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})))
            .mount(&server)
            .await;

        let mut settings = fast_settings(server.uri(), 2);
        settings.timeout = Duration::from_millis(100);
        let client = RacingApiClient::new(settings).unwrap();
        let result = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await;
        tokio_test::assert_ok!(result);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn timeouts_exhaust_into_transient_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut settings = fast_settings(server.uri(), 1);
        settings.timeout = Duration::from_millis(100);
        let client = RacingApiClient::new(settings).unwrap();
        let err = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::TransientUpstream { status: None, attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn dropped_connections_are_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = seen.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                if n == 0 {
                    // Close without answering.
                    drop(socket);
                    continue;
                }
                let body = r#"{"results":[]}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let client = RacingApiClient::new(fast_settings(format!("http://{addr}"), 3)).unwrap();
        let body = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"results": []}));
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = RacingApiClient::new(fast_settings(server.uri(), 1)).unwrap();
        let err = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            IngestError::TransientUpstream {
                status, attempts, ..
            } => {
                assert_eq!(status, Some(503));
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/racecards"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such day"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let client = RacingApiClient::new(fast_settings(server.uri(), 4)).unwrap();
        let cancel = CancellationToken::new();

        let err = client.fetch_racecards(date(), &regions(), &cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::Http { status: 404, .. }));

        let err = client.fetch_results(date(), &regions(), &cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::AuthOrPlanRestricted { status: 401, .. }));

        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_json_is_malformed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = RacingApiClient::new(fast_settings(server.uri(), 2)).unwrap();
        let err = client
            .fetch_results(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MalformedPayload(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn summaries_fall_back_to_full_racecards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/racecards/summaries"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/racecards"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"racecards": [{"id": "m1"}]})),
            )
            .mount(&server)
            .await;

        let client = RacingApiClient::new(fast_settings(server.uri(), 0)).unwrap();
        let body = client
            .fetch_racecard_summaries_or_full(date(), &regions(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body["racecards"][0]["id"], "m1");
    }

    #[tokio::test]
    async fn pre_cancelled_token_sends_nothing() {
        let server = MockServer::start().await;
        let client = RacingApiClient::new(fast_settings(server.uri(), 0)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.fetch_results(date(), &regions(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_pacing_wait() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let mut settings = fast_settings(server.uri(), 0);
        settings.rate_limit_rps = 0.2;
        let client = RacingApiClient::new(settings).unwrap();
        let cancel = CancellationToken::new();

        client.fetch_results(date(), &regions(), &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = client.fetch_results(date(), &regions(), &cancel).await.unwrap_err();
        let waited = started.elapsed();

        assert!(err.is_cancelled());
        assert!(waited < Duration::from_millis(100) + SLEEP_SLICE + Duration::from_millis(150));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sleep_with_cancel_returns_promptly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = sleep_with_cancel(Duration::from_secs(10), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
