// Upstream market-data boundary
pub mod deribit; // Deribit HTTP client (snapshots, auth, one-shot trading ops)

use async_trait::async_trait;
use thiserror::Error;

/// Source of order-book snapshots. The relay core only depends on this seam;
/// the production implementation is [`deribit::DeribitClient`].
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch one snapshot for `instrument` at the given book depth. The raw
    /// payload is relayed to clients as-is; a failure skips the instrument
    /// for the current cycle only.
    async fn fetch_snapshot(&self, instrument: &str, depth: u32) -> Result<String, UpstreamError>;
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {message}")]
    Api {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("auth response carried no access_token")]
    Auth,
    #[error("CLIENT_ID / API_KEY not configured")]
    MissingCredentials,
}
