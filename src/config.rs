//! Service configuration, read from the environment.
//!
//! Credentials may come from env vars or, for the password, a Docker secret
//! file. Everything else has a default suitable for local runs.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientSettings;

pub const USERNAME_VAR: &str = "THERACINGAPI_USERNAME";
pub const PASSWORD_VAR: &str = "THERACINGAPI_PASSWORD";
pub const API_KEY_VAR: &str = "THERACINGAPI_API_KEY";

const PASSWORD_SECRET_FILE: &str = "/run/secrets/theracingapi_password";
const DEFAULT_BASE_URL: &str = "https://api.theracingapi.com/v1";

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub database_path: PathBuf,
    pub report_dir: PathBuf,
    pub regions: Vec<String>,
    /// Fixed ingestion date; `None` means "today" at the time of each run.
    pub ingest_date: Option<NaiveDate>,
    pub rate_limit_rps: f64,
    pub max_retries: u32,
    pub minimal_payload: bool,
    pub poll_interval_seconds: u64,
    pub health_port: u16,
    /// If true, run once and exit (no polling loop)
    pub run_once: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = match lookup(USERNAME_VAR) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            Some(_) => return Err(anyhow!("{USERNAME_VAR} is set but empty")),
            None => return Err(anyhow!("{USERNAME_VAR} is required")),
        };

        let password = match lookup(PASSWORD_VAR) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            Some(_) => return Err(anyhow!("{PASSWORD_VAR} is set but empty")),
            None => read_secret_file(PASSWORD_SECRET_FILE, "theracingapi_password")?,
        };

        reject_placeholder(USERNAME_VAR, &username)?;
        reject_placeholder(PASSWORD_VAR, &password)?;

        let api_key = lookup(API_KEY_VAR)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(key) = &api_key {
            reject_placeholder(API_KEY_VAR, key)?;
        }

        let ingest_date = match lookup("INGEST_DATE").filter(|v| !v.trim().is_empty()) {
            Some(v) => Some(
                NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                    .with_context(|| format!("INGEST_DATE must be YYYY-MM-DD, got {v:?}"))?,
            ),
            None => None,
        };

        let regions = normalize_regions(
            lookup("REGIONS")
                .unwrap_or_else(|| "gb,ire".to_string())
                .split(','),
        );
        if regions.is_empty() {
            return Err(anyhow!("REGIONS must name at least one region code"));
        }

        Ok(Self {
            username,
            password,
            api_key,
            base_url: lookup("RACING_API_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            database_path: lookup("DATABASE_PATH")
                .unwrap_or_else(|| "output/racing.sqlite".to_string())
                .into(),
            report_dir: lookup("REPORT_DIR")
                .unwrap_or_else(|| "output".to_string())
                .into(),
            regions,
            ingest_date,
            rate_limit_rps: lookup("RATE_LIMIT_RPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2.0),
            max_retries: lookup("MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            minimal_payload: flag(lookup("MINIMAL_PAYLOAD")),
            poll_interval_seconds: lookup("POLL_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            health_port: lookup("HEALTH_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8084),
            run_once: flag(lookup("RUN_ONCE")),
        })
    }

    /// Date to ingest on this tick.
    pub fn effective_date(&self) -> NaiveDate {
        self.ingest_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            api_key: self.api_key.clone(),
            max_retries: self.max_retries,
            rate_limit_rps: self.rate_limit_rps,
            ..ClientSettings::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Read a secret from Docker secret file
fn read_secret_file(file_path: &str, secret_name: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!(
            "Secret not provided: set the env var or mount {} ({})",
            file_path, secret_name
        ))
}

// Prevent accidental use of sample/placeholder credentials
fn reject_placeholder(name: &str, value: &str) -> Result<()> {
    let lower = value.trim().to_lowercase();
    if lower.contains("change_me") || lower.starts_with("your_") || lower.starts_with("sample") {
        return Err(anyhow!(
            "{name} appears to be a placeholder value; replace it with your real credential"
        ));
    }
    Ok(())
}

/// Lowercase a region/country code and fold common aliases onto the
/// codes the API expects.
pub fn normalize_region_code(code: &str) -> String {
    let lower = code.trim().to_lowercase();
    match lower.as_str() {
        "gbr" | "uk" => "gb".to_string(),
        "irl" | "ie" => "ire".to_string(),
        "hkg" => "hk".to_string(),
        "usa" => "us".to_string(),
        "aus" => "au".to_string(),
        "fra" => "fr".to_string(),
        _ => lower,
    }
}

pub fn normalize_regions<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for code in codes {
        let normalized = normalize_region_code(code.as_ref());
        if !normalized.is_empty() && !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Which credential variables are configured. Values are never exposed.
pub fn secret_status() -> Vec<(&'static str, bool)> {
    [USERNAME_VAR, PASSWORD_VAR, API_KEY_VAR]
        .into_iter()
        .map(|key| (key, env::var(key).map(|v| !v.is_empty()).unwrap_or(false)))
        .collect()
}
