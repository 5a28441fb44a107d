use std::time::Duration;

/// Failure of a single outbound call. Every kind leads to the same place: the
/// caller's fallback.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return UpstreamError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        UpstreamError::Connection(e.to_string())
    }
}
