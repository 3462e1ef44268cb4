//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    /// 429/5xx or a timeout/connect failure that outlived every retry.
    #[error("upstream unavailable after {attempts} attempts (status {}): {message}", status_label(.status))]
    TransientUpstream {
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    /// Credentials rejected or the endpoint is not on the caller's plan.
    #[error("upstream rejected request (status {status}): {message}")]
    AuthOrPlanRestricted { status: u16, message: String },

    /// Any other non-success status. Never retried.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("report write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }

    /// True when the error text reads like a subscription-plan restriction.
    pub fn is_plan_restriction(&self) -> bool {
        !self.is_cancelled() && mentions_plan_restriction(&self.to_string())
    }

    /// Map a non-retryable HTTP status and its body onto the taxonomy.
    pub(crate) fn from_rejection(status: u16, body: String) -> Self {
        if status == 401 || status == 403 || mentions_plan_restriction(&body) {
            IngestError::AuthOrPlanRestricted {
                status,
                message: body,
            }
        } else {
            IngestError::Http { status, body }
        }
    }
}

pub(crate) fn mentions_plan_restriction(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("plan") && (lower.contains("standard") || lower.contains("basic"))
}
