use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use super::error::RelayError;
use super::session::Session;
use crate::config::RelayConfig;
use crate::upstream::SnapshotSource;

/// The relay: listens for websocket clients and runs one [`Session`] per
/// accepted connection. Sessions share nothing except the snapshot source.
pub struct Relay {
    cfg: RelayConfig,
    source: Arc<dyn SnapshotSource>,
    next_session_id: AtomicU64,
}

impl Relay {
    pub fn new(cfg: RelayConfig, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            cfg,
            source,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind the configured endpoint and serve until a fatal listener error.
    pub async fn run(self) -> Result<(), RelayError> {
        let addr = self.cfg.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        info!(%addr, "relay listening");
        self.serve(listener).await
    }

    /// Accept loop. The handshake runs in the per-connection task, so a slow
    /// or stuck upgrade never blocks acceptance. Dropping the returned
    /// future aborts every live session.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(RelayError::Accept)?;
                    let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    let source = Arc::clone(&self.source);
                    let poll_interval = self.cfg.poll_interval();
                    let book_depth = self.cfg.book_depth;
                    sessions.spawn(handle_connection(
                        id,
                        stream,
                        peer,
                        source,
                        poll_interval,
                        book_depth,
                    ));
                }
                Some(finished) = sessions.join_next() => {
                    if let Err(e) = finished {
                        if !e.is_cancelled() {
                            warn!("session task panicked: {e}");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    source: Arc<dyn SnapshotSource>,
    poll_interval: Duration,
    book_depth: u32,
) {
    // A failed upgrade only costs this connection.
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };

    info!(session = id, %peer, "client connected");
    metrics::counter!("relay_sessions_opened").increment(1);
    metrics::gauge!("relay_active_sessions").increment(1.0);

    // Outcome logging happens inside the session; the result only matters
    // to that client.
    let _ = Session::new(id, peer.to_string(), ws, source, poll_interval, book_depth)
        .run()
        .await;

    metrics::gauge!("relay_active_sessions").decrement(1.0);
}
