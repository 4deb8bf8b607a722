use std::collections::{BTreeSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::error::SessionError;
use crate::upstream::SnapshotSource;

/// One connected client: its websocket, its subscription set, and the
/// poll/drain cycle pushing order-book snapshots back to it.
///
/// The session task exclusively owns everything here. All pending work is
/// multiplexed by `select!` inside that one task, so at most one send and at
/// most one timer can exist at any instant.
pub struct Session<S> {
    id: u64,
    peer: String,
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    /// Instruments this client asked for. Sorted iteration doubles as the
    /// deterministic fetch-issue order within a cycle.
    subscriptions: BTreeSet<String>,
    /// Frames fetched by the current cycle, waiting to be drained in FIFO
    /// order. Payloads live here for exactly one send attempt.
    queue: VecDeque<String>,
    phase: Phase,
    source: Arc<dyn SnapshotSource>,
    poll_interval: Duration,
    book_depth: u32,
}

/// Session lifecycle. Exactly one variant is live at a time; a new cycle can
/// only start from `Draining` once the queue is empty. The pre-handshake
/// stage lives in the acceptor: a `Session` only exists after the upgrade
/// succeeded.
enum Phase {
    /// No subscription received yet; nothing scheduled.
    Idle,
    /// A cycle task is fetching snapshots for this cycle's instruments.
    Polling(JoinHandle<Vec<(String, String)>>),
    /// The inter-cycle timer is pending. At most one exists per session.
    Armed(Pin<Box<Sleep>>),
    /// Queued frames are being written out, one send at a time.
    Draining,
    Closed,
}

enum Inbound {
    Subscribed,
    CloseRequested,
    Ignored,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        ws: WebSocketStream<S>,
        source: Arc<dyn SnapshotSource>,
        poll_interval: Duration,
        book_depth: u32,
    ) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id,
            peer: peer.into(),
            sink,
            stream,
            subscriptions: BTreeSet::new(),
            queue: VecDeque::new(),
            phase: Phase::Idle,
            source,
            poll_interval,
            book_depth,
        }
    }

    /// Drive the session until the client goes away or the transport fails,
    /// then release everything exactly once.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        self.shutdown().await;
        match &result {
            Ok(()) => info!(session = self.id, peer = %self.peer, "session closed"),
            Err(e) => warn!(session = self.id, peer = %self.peer, "session terminated: {e}"),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Closed);
            let next = match phase {
                Phase::Idle => self.step_idle().await?,
                Phase::Polling(cycle) => self.step_polling(cycle).await?,
                Phase::Armed(timer) => self.step_armed(timer).await?,
                Phase::Draining => self.step_drain().await?,
                Phase::Closed => return Ok(()),
            };
            self.phase = next;
        }
    }

    /// Before the first subscription only reads can happen.
    async fn step_idle(&mut self) -> Result<Phase, SessionError> {
        match self.stream.next().await {
            Some(Ok(frame)) => match self.handle_frame(frame) {
                Inbound::Subscribed => Ok(self.start_poll_cycle()),
                Inbound::CloseRequested => Ok(Phase::Closed),
                Inbound::Ignored => Ok(Phase::Idle),
            },
            Some(Err(e)) => Err(SessionError::Read(e)),
            None => Ok(Phase::Closed),
        }
    }

    /// Wait for the cycle task while staying responsive to inbound frames.
    /// Subscriptions landing here are picked up by the next cycle.
    async fn step_polling(
        &mut self,
        mut cycle: JoinHandle<Vec<(String, String)>>,
    ) -> Result<Phase, SessionError> {
        tokio::select! {
            joined = &mut cycle => {
                match joined {
                    Ok(snapshots) => {
                        for (instrument, payload) in snapshots {
                            self.queue.push_back(tag_snapshot(&instrument, &payload));
                        }
                    }
                    // A lost cycle task behaves like an all-instruments fetch
                    // failure: drop the round, let the next cycle retry.
                    Err(e) => warn!(session = self.id, "poll cycle task failed: {e}"),
                }
                Ok(Phase::Armed(Box::pin(sleep(self.poll_interval))))
            }
            frame = self.stream.next() => match frame {
                Some(Ok(frame)) => match self.handle_frame(frame) {
                    Inbound::CloseRequested => {
                        cycle.abort();
                        Ok(Phase::Closed)
                    }
                    _ => Ok(Phase::Polling(cycle)),
                },
                Some(Err(e)) => {
                    cycle.abort();
                    Err(SessionError::Read(e))
                }
                None => {
                    cycle.abort();
                    Ok(Phase::Closed)
                }
            },
        }
    }

    async fn step_armed(&mut self, mut timer: Pin<Box<Sleep>>) -> Result<Phase, SessionError> {
        tokio::select! {
            () = timer.as_mut() => Ok(Phase::Draining),
            frame = self.stream.next() => match frame {
                Some(Ok(frame)) => match self.handle_frame(frame) {
                    Inbound::CloseRequested => Ok(Phase::Closed),
                    // The timer keeps its remaining delay across inbound frames.
                    _ => Ok(Phase::Armed(timer)),
                },
                Some(Err(e)) => Err(SessionError::Read(e)),
                None => Ok(Phase::Closed),
            },
        }
    }

    /// Send the queue head and wait for completion before touching the next
    /// element; a write failure kills the session with no retry. Once empty,
    /// the next poll cycle starts.
    async fn step_drain(&mut self) -> Result<Phase, SessionError> {
        match self.queue.pop_front() {
            Some(payload) => {
                self.sink
                    .send(Message::Text(payload))
                    .await
                    .map_err(SessionError::Write)?;
                metrics::counter!("relay_snapshots_sent").increment(1);
                Ok(Phase::Draining)
            }
            None => Ok(self.start_poll_cycle()),
        }
    }

    /// Kick off one fetch round for the instruments subscribed right now.
    /// The fetches run concurrently in a detached task so a slow upstream
    /// never stalls this or any other session's event handling.
    fn start_poll_cycle(&mut self) -> Phase {
        let instruments: Vec<String> = self.subscriptions.iter().cloned().collect();
        if instruments.is_empty() {
            return Phase::Armed(Box::pin(sleep(self.poll_interval)));
        }

        let source = Arc::clone(&self.source);
        let depth = self.book_depth;
        let session = self.id;
        let cycle = tokio::spawn(async move {
            let fetches = instruments.into_iter().map(|instrument| {
                let source = Arc::clone(&source);
                async move {
                    match source.fetch_snapshot(&instrument, depth).await {
                        Ok(payload) => Some((instrument, payload)),
                        Err(e) => {
                            warn!(
                                session,
                                instrument = %instrument,
                                "snapshot fetch failed, skipped for this cycle: {e}"
                            );
                            metrics::counter!("relay_fetch_failures").increment(1);
                            None
                        }
                    }
                }
            });
            // join_all keeps issue order, so enqueue order matches fetch order.
            futures::future::join_all(fetches)
                .await
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
        });
        Phase::Polling(cycle)
    }

    fn handle_frame(&mut self, frame: Message) -> Inbound {
        match frame {
            // The whole payload is the instrument name. There is no
            // unsubscribe and nothing is acked back to the client.
            Message::Text(instrument) => {
                if self.subscriptions.insert(instrument.clone()) {
                    info!(session = self.id, instrument = %instrument, "subscribed");
                    metrics::counter!("relay_subscriptions").increment(1);
                }
                Inbound::Subscribed
            }
            Message::Close(_) => Inbound::CloseRequested,
            Message::Binary(_) => {
                debug!(session = self.id, "ignoring binary frame");
                Inbound::Ignored
            }
            // Ping/pong is answered by the transport while we read.
            _ => Inbound::Ignored,
        }
    }

    /// Cancel whatever is pending and close the channel exactly once.
    async fn shutdown(&mut self) {
        if let Phase::Polling(cycle) = std::mem::replace(&mut self.phase, Phase::Closed) {
            cycle.abort();
        }
        // An armed timer was already dropped with its phase value.
        let _ = self.sink.close().await;
    }
}

/// Outbound frames carry the instrument name so a client with several
/// subscriptions can attribute each snapshot. The upstream payload is
/// embedded verbatim when it is JSON, else as a JSON string.
fn tag_snapshot(instrument: &str, payload: &str) -> String {
    let data = serde_json::from_str::<serde_json::Value>(payload)
        .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
    serde_json::json!({ "instrument": instrument, "data": data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::Value;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Scripted fetcher: records every call, fails the instruments listed in
    /// `failing`, optionally stalls to let tests disconnect mid-cycle.
    #[derive(Default)]
    struct ScriptedSource {
        calls: Mutex<Vec<String>>,
        failing: Mutex<BTreeSet<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(
            &self,
            instrument: &str,
            depth: u32,
        ) -> Result<String, UpstreamError> {
            self.calls.lock().push(instrument.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.lock().contains(instrument) {
                return Err(UpstreamError::Api {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    message: "scripted failure".to_string(),
                });
            }
            Ok(format!(
                r#"{{"instrument_name":"{instrument}","depth":{depth}}}"#
            ))
        }
    }

    async fn ws_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None);
        tokio::join!(server, client)
    }

    async fn start(
        source: Arc<ScriptedSource>,
        poll_interval: Duration,
    ) -> (
        tokio::task::JoinHandle<Result<(), SessionError>>,
        WebSocketStream<DuplexStream>,
    ) {
        let (server, client) = ws_pair().await;
        let session = Session::new(1, "test-client", server, source, poll_interval, 3);
        (tokio::spawn(session.run()), client)
    }

    async fn next_json(ws: &mut WebSocketStream<DuplexStream>) -> Value {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        serde_json::from_str(frame.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn duplicate_subscriptions_collapse_to_distinct_set() {
        let (server, _client) = ws_pair().await;
        let mut session = Session::new(
            1,
            "test-client",
            server,
            Arc::new(ScriptedSource::default()),
            Duration::from_secs(5),
            3,
        );

        for name in ["BTC-PERPETUAL", "BTC-PERPETUAL", "ETH-PERPETUAL"] {
            session.handle_frame(Message::Text(name.to_string()));
        }

        let expected: BTreeSet<String> = ["BTC-PERPETUAL", "ETH-PERPETUAL"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(session.subscriptions, expected);
    }

    proptest! {
        /// Any sequence of subscribe frames leaves exactly the set of
        /// distinct identifiers, order-independent.
        #[test]
        fn subscription_set_is_the_distinct_ids(
            names in proptest::collection::vec("[A-Z]{1,6}(-[A-Z]{1,10})?", 0..24)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (server, _client) = ws_pair().await;
                let mut session = Session::new(
                    1,
                    "test-client",
                    server,
                    Arc::new(ScriptedSource::default()),
                    Duration::from_secs(5),
                    3,
                );
                for name in &names {
                    session.handle_frame(Message::Text(name.clone()));
                }
                let expected: BTreeSet<String> = names.iter().cloned().collect();
                prop_assert_eq!(&session.subscriptions, &expected);
                Ok(())
            })?;
        }

        #[test]
        fn tagged_frames_always_name_their_instrument(
            instrument in ".*",
            payload in ".*",
        ) {
            let frame = tag_snapshot(&instrument, &payload);
            let v: Value = serde_json::from_str(&frame).unwrap();
            prop_assert_eq!(v["instrument"].as_str().unwrap(), instrument.as_str());
            match serde_json::from_str::<Value>(&payload) {
                Ok(parsed) => prop_assert_eq!(&v["data"], &parsed),
                Err(_) => prop_assert_eq!(v["data"].as_str().unwrap(), payload.as_str()),
            }
        }
    }

    #[tokio::test]
    async fn first_subscription_delivers_tagged_snapshot_within_one_interval() {
        let source = Arc::new(ScriptedSource::default());
        let (_session, mut client) = start(Arc::clone(&source), Duration::from_millis(50)).await;

        client
            .send(Message::Text("BTC-PERPETUAL".to_string()))
            .await
            .unwrap();

        let frame = next_json(&mut client).await;
        assert_eq!(frame["instrument"], "BTC-PERPETUAL");
        assert_eq!(frame["data"]["instrument_name"], "BTC-PERPETUAL");
        assert_eq!(frame["data"]["depth"], 3);
    }

    #[tokio::test]
    async fn one_cycle_delivers_both_instruments_in_fetch_order() {
        let source = Arc::new(ScriptedSource::default());
        let (_session, mut client) = start(Arc::clone(&source), Duration::from_millis(50)).await;

        // "AAA" triggers the first cycle immediately with only itself in the
        // snapshot; "BBB" lands during that cycle and joins the second one.
        client.send(Message::Text("AAA".to_string())).await.unwrap();
        client.send(Message::Text("BBB".to_string())).await.unwrap();

        assert_eq!(next_json(&mut client).await["instrument"], "AAA");

        let second_cycle = (next_json(&mut client).await, next_json(&mut client).await);
        assert_eq!(second_cycle.0["instrument"], "AAA");
        assert_eq!(second_cycle.1["instrument"], "BBB");
    }

    #[tokio::test]
    async fn failed_fetch_skips_instrument_but_not_the_others() {
        let source = Arc::new(ScriptedSource::default());
        source.failing.lock().insert("AAA".to_string());
        let (_session, mut client) = start(Arc::clone(&source), Duration::from_millis(50)).await;

        client.send(Message::Text("AAA".to_string())).await.unwrap();
        client.send(Message::Text("BBB".to_string())).await.unwrap();

        // Cycle 1 ({AAA}) produces nothing; cycle 2 drops AAA and still
        // delivers BBB.
        assert_eq!(next_json(&mut client).await["instrument"], "BBB");

        // Un-breaking the upstream lets a later cycle retry AAA naturally.
        source.failing.lock().clear();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "AAA never retried");
            if next_json(&mut client).await["instrument"] == "AAA" {
                break;
            }
        }
    }

    #[tokio::test]
    async fn disconnect_mid_cycle_cancels_fetches_and_timer() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(200),
            ..ScriptedSource::default()
        });
        let (session, mut client) = start(Arc::clone(&source), Duration::from_millis(50)).await;

        client
            .send(Message::Text("XRP-PERPETUAL".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls.lock().len(), 1, "cycle should be in flight");

        // Abrupt disconnect while the fetch is still sleeping.
        drop(client);

        timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not terminate")
            .unwrap()
            .expect_err("abrupt disconnect should surface as a read error");

        // No re-fetch and no timer re-arm after teardown.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(source.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn close_frame_terminates_cleanly() {
        let source = Arc::new(ScriptedSource::default());
        let (session, mut client) = start(Arc::clone(&source), Duration::from_millis(50)).await;

        client.close(None).await.unwrap();

        let result = timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not terminate")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn non_json_payloads_are_tagged_as_strings() {
        let frame = tag_snapshot("BTC-PERPETUAL", "plain text body");
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["instrument"], "BTC-PERPETUAL");
        assert_eq!(v["data"], "plain text body");
    }
}
