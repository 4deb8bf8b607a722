use std::net::SocketAddr;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Listener-level failures. Both are process-fatal: the relay cannot keep
/// accepting, so the error is surfaced to the binary.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Transport failures on one session. Both tear that session down; no other
/// session is affected and nothing is retried.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport read failed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("transport write failed: {0}")]
    Write(#[source] tungstenite::Error),
}
