use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::server::{serve_channel, EnvelopeRouter};
use super::FrameStream;
use crate::error::TransportError;
use crate::event_sourcing::{EventLog, TagStream};
use crate::metrics::Metrics;
use crate::replication::wire::decode_ack;
use crate::replication::wire::proto::datacenter_replication_client::DatacenterReplicationClient;
use crate::replication::{EventEnvelope, Frame};
use crate::utils::{CircuitBreaker, CircuitBreakerError};

// ============================================================================
// Replication Client
// ============================================================================
//
// Responsibilities:
// 1. Follow the local events carrying a replication tag, from an offset
// 2. Send each one as an EventEnvelope frame, at most `max_in_flight`
//    unacknowledged at once
// 3. Match inbound Ack frames to sent envelopes in order; an envelope
//    not acknowledged within `ack_timeout` fails the stream
// 4. Yield the acknowledged offsets; a zero (not applied) ack fails the
//    stream with the offset of the envelope it answers
//
// The caller persists the yielded offsets and restarts from the last one
// when the stream fails, so an envelope the peer did not apply is sent
// again.
//
// ============================================================================

/// Acknowledged source offsets. Ends with the first error.
pub type AckStream = BoxStream<'static, Result<u64, TransportError>>;

/// Opens a duplex channel to a peer datacenter.
#[async_trait]
pub trait DuplexConnector: Send + Sync + 'static {
    async fn connect(&self, outbound: BoxStream<'static, Frame>) -> Result<FrameStream, TransportError>;
}

/// Channel over gRPC bidirectional streaming.
pub struct GrpcConnector {
    endpoint: String,
    breaker: CircuitBreaker,
}

impl GrpcConnector {
    pub fn new(endpoint: impl Into<String>, breaker: CircuitBreaker) -> Self {
        Self {
            endpoint: endpoint.into(),
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl DuplexConnector for GrpcConnector {
    async fn connect(&self, outbound: BoxStream<'static, Frame>) -> Result<FrameStream, TransportError> {
        let endpoint = self.endpoint.clone();
        let open = async {
            let mut client = DatacenterReplicationClient::connect(endpoint.clone())
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                })?;
            let response = client.replicate(opaque_stream(outbound)).await?;
            Ok::<_, TransportError>(response.into_inner())
        };

        match self.breaker.call(open).await {
            Ok(inbound) => Ok(inbound.map(|frame| frame.map_err(TransportError::from)).boxed()),
            Err(CircuitBreakerError::CircuitOpen) => Err(TransportError::Connect {
                endpoint: self.endpoint.clone(),
                message: "circuit breaker open".to_string(),
            }),
            Err(CircuitBreakerError::OperationFailed(err)) => Err(err),
        }
    }
}

/// Re-exposes a boxed stream as an opaque `impl Stream`; the compiler cannot
/// prove the tonic request future `Send` when given a `BoxStream` directly.
fn opaque_stream(mut inner: BoxStream<'static, Frame>) -> impl futures_util::Stream<Item = Frame> + Send + 'static {
    stream::poll_fn(move |cx| inner.poll_next_unpin(cx))
}

/// Channel served in-process by a local router. Used for single-binary
/// multi-region setups and tests.
pub struct LoopbackConnector {
    router: Arc<dyn EnvelopeRouter>,
    max_in_flight: usize,
}

impl LoopbackConnector {
    pub fn new(router: Arc<dyn EnvelopeRouter>, max_in_flight: usize) -> Self {
        Self { router, max_in_flight }
    }
}

#[async_trait]
impl DuplexConnector for LoopbackConnector {
    async fn connect(&self, outbound: BoxStream<'static, Frame>) -> Result<FrameStream, TransportError> {
        Ok(serve_channel(outbound.map(Ok), self.router.clone(), self.max_in_flight).boxed())
    }
}

#[derive(Clone)]
pub struct ReplicationClient {
    peer: String,
    log: Arc<dyn EventLog>,
    connector: Arc<dyn DuplexConnector>,
    max_in_flight: usize,
    ack_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ReplicationClient {
    pub fn new(
        peer: impl Into<String>,
        log: Arc<dyn EventLog>,
        connector: Arc<dyn DuplexConnector>,
        max_in_flight: usize,
        ack_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            peer: peer.into(),
            log,
            connector,
            max_in_flight: max_in_flight.max(1),
            ack_timeout,
            metrics,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Replicate events tagged `tag` with offsets after `after_offset`.
    pub async fn replicate(&self, tag: &str, after_offset: u64) -> Result<AckStream, TransportError> {
        let source = self.log.events_by_tag(tag, after_offset).await?;

        let (frames_tx, frames_rx) = mpsc::channel::<Frame>(self.max_in_flight);
        let outbound = stream::unfold(frames_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        let inbound = self.connector.connect(outbound).await?;

        tracing::info!(peer = %self.peer, tag, after_offset, "🔗 Replication channel open");

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(
            source,
            frames_tx,
            permits.clone(),
            sent_tx,
            self.peer.clone(),
            self.metrics.clone(),
        ));

        let acks = AckLoop {
            inbound,
            sent: sent_rx,
            source_done: false,
            outstanding: VecDeque::new(),
            permits,
            ack_timeout: self.ack_timeout,
            peer: self.peer.clone(),
            metrics: self.metrics.clone(),
            pump: PumpGuard(pump),
            failed: false,
        };

        Ok(stream::unfold(acks, |mut acks| async move {
            if acks.failed {
                return None;
            }
            let item = acks.next_ack().await?;
            acks.failed = item.is_err();
            Some((item, acks))
        })
        .boxed())
    }
}

enum Sent {
    Envelope { at: Instant, offset: u64 },
    SourceFailed(TransportError),
}

/// Moves tagged events onto the channel while permits are available.
async fn pump(
    mut source: TagStream,
    frames: mpsc::Sender<Frame>,
    permits: Arc<Semaphore>,
    sent: mpsc::UnboundedSender<Sent>,
    peer: String,
    metrics: Arc<Metrics>,
) {
    while let Some(item) = source.next().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                let _ = sent.send(Sent::SourceFailed(err.into()));
                return;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        permit.forget();

        // Record the send before the frame can be acknowledged.
        let envelope = EventEnvelope::from_persisted(&event);
        let record = Sent::Envelope {
            at: Instant::now(),
            offset: envelope.timestamp,
        };
        if sent.send(record).is_err() {
            return;
        }
        if frames.send(Frame::envelope(&envelope)).await.is_err() {
            return;
        }

        metrics.envelopes_sent.with_label_values(&[peer.as_str()]).inc();
        metrics.envelopes_in_flight.with_label_values(&[peer.as_str()]).inc();
        tracing::trace!(
            peer = %peer,
            aggregate_id = %envelope.aggregate_id,
            sequence = envelope.sequence_number,
            offset = envelope.timestamp,
            "📤 Envelope sent"
        );
    }
}

struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct AckLoop {
    inbound: FrameStream,
    sent: mpsc::UnboundedReceiver<Sent>,
    source_done: bool,
    /// Send time and offset of unacknowledged envelopes, oldest first.
    outstanding: VecDeque<(Instant, u64)>,
    permits: Arc<Semaphore>,
    ack_timeout: Duration,
    peer: String,
    metrics: Arc<Metrics>,
    pump: PumpGuard,
    failed: bool,
}

impl AckLoop {
    async fn next_ack(&mut self) -> Option<Result<u64, TransportError>> {
        loop {
            let deadline = self.outstanding.front().map(|(at, _)| *at + self.ack_timeout);
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                sent = self.sent.recv(), if !self.source_done => match sent {
                    Some(sent) => {
                        if let Err(err) = self.record(sent) {
                            return Some(Err(err));
                        }
                    }
                    None => self.source_done = true,
                },
                frame = self.inbound.next() => match frame {
                    Some(Ok(frame)) => {
                        let Some(bytes) = frame.into_binary() else { continue };
                        let ack = match decode_ack(&bytes) {
                            Ok(ack) => ack,
                            Err(err) => return Some(Err(err)),
                        };
                        let sent_offset = match self.settle() {
                            Ok(offset) => offset,
                            Err(err) => return Some(Err(err)),
                        };
                        if ack.offset == 0 {
                            self.count_ack("not_applied");
                            let offset = sent_offset.unwrap_or_default();
                            tracing::warn!(peer = %self.peer, offset, "Peer did not apply an envelope");
                            return Some(Err(TransportError::NotApplied { offset }));
                        }
                        self.count_ack("applied");
                        return Some(Ok(ack.offset));
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None if self.source_done && self.outstanding.is_empty() => return None,
                    None => return Some(Err(TransportError::Closed)),
                },
                _ = expired => {
                    tracing::warn!(
                        peer = %self.peer,
                        outstanding = self.outstanding.len(),
                        "⏱️ Acknowledgment timed out"
                    );
                    return Some(Err(TransportError::AckTimeout(self.ack_timeout)));
                }
            }
        }
    }

    fn record(&mut self, sent: Sent) -> Result<(), TransportError> {
        match sent {
            Sent::Envelope { at, offset } => {
                self.outstanding.push_back((at, offset));
                Ok(())
            }
            Sent::SourceFailed(err) => Err(err),
        }
    }

    /// Retire the oldest outstanding envelope, returning its offset.
    fn settle(&mut self) -> Result<Option<u64>, TransportError> {
        while let Ok(sent) = self.sent.try_recv() {
            self.record(sent)?;
        }
        let Some((_, offset)) = self.outstanding.pop_front() else {
            tracing::warn!(peer = %self.peer, "Acknowledgment without an outstanding envelope");
            return Ok(None);
        };
        self.permits.add_permits(1);
        self.metrics
            .envelopes_in_flight
            .with_label_values(&[self.peer.as_str()])
            .dec();
        Ok(Some(offset))
    }

    fn count_ack(&self, result: &str) {
        self.metrics
            .acks_received
            .with_label_values(&[self.peer.as_str(), result])
            .inc();
    }
}

impl Drop for AckLoop {
    fn drop(&mut self) {
        self.metrics
            .envelopes_in_flight
            .with_label_values(&[self.peer.as_str()])
            .sub(self.outstanding.len() as i64);
        tracing::debug!(peer = %self.peer, pump_finished = self.pump.0.is_finished(), "Replication channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::event_sourcing::{InMemoryEventLog, NewEvent};

    fn tagged(tag: &str) -> NewEvent {
        NewEvent {
            event_type: "Written".into(),
            payload: br#"{"Written":{"value":"x"}}"#.to_vec(),
            tags: vec![tag.to_string()],
        }
    }

    /// Acks every envelope with its offset, except sequence numbers in `refuse`.
    struct EchoRouter {
        refuse: Vec<u64>,
        routed: Mutex<Vec<(String, u64)>>,
        delay: Duration,
    }

    impl EchoRouter {
        fn new() -> Self {
            Self {
                refuse: vec![],
                routed: Mutex::new(vec![]),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EnvelopeRouter for EchoRouter {
        async fn route(&self, envelope: EventEnvelope) -> u64 {
            tokio::time::sleep(self.delay).await;
            if let Ok(mut routed) = self.routed.lock() {
                routed.push((envelope.aggregate_id.clone(), envelope.sequence_number));
            }
            if self.refuse.contains(&envelope.sequence_number) {
                0
            } else {
                envelope.timestamp
            }
        }
    }

    /// Accepts the channel and never answers.
    struct SilentPeer;

    #[async_trait]
    impl DuplexConnector for SilentPeer {
        async fn connect(&self, outbound: BoxStream<'static, Frame>) -> Result<FrameStream, TransportError> {
            // Keep reading so the sender is not blocked on a full channel.
            tokio::spawn(outbound.for_each(|_| async {}));
            Ok(stream::pending().boxed())
        }
    }

    /// Answers with whatever frames it was given, then closes.
    struct ScriptedPeer(Mutex<Vec<Frame>>);

    #[async_trait]
    impl DuplexConnector for ScriptedPeer {
        async fn connect(&self, outbound: BoxStream<'static, Frame>) -> Result<FrameStream, TransportError> {
            tokio::spawn(outbound.for_each(|_| async {}));
            let frames = std::mem::take(&mut *self.0.lock().unwrap());
            Ok(stream::iter(frames.into_iter().map(Ok)).chain(stream::pending()).boxed())
        }
    }

    fn client(log: Arc<InMemoryEventLog>, connector: Arc<dyn DuplexConnector>, ack_timeout: Duration) -> ReplicationClient {
        ReplicationClient::new("us", log, connector, 2, ack_timeout, Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_acknowledged_offsets_are_yielded_in_order() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us"), tagged("t@us"), tagged("t@us")]).await.unwrap();

        let router = Arc::new(EchoRouter::new());
        let connector = Arc::new(LoopbackConnector::new(router.clone(), 4));
        let mut acks = client(log, connector, Duration::from_secs(1)).replicate("t@us", 0).await.unwrap();

        let mut offsets = vec![];
        for _ in 0..3 {
            offsets.push(acks.next().await.unwrap().unwrap());
        }
        assert_eq!(offsets, vec![1, 2, 3]);
        let sequences: Vec<u64> = router.routed.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_ack_fails_the_stream_at_that_envelope() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us"), tagged("t@us"), tagged("t@us")]).await.unwrap();

        let router = Arc::new(EchoRouter {
            refuse: vec![2],
            ..EchoRouter::new()
        });
        let connector = Arc::new(LoopbackConnector::new(router, 4));
        let mut acks = client(log, connector, Duration::from_secs(1)).replicate("t@us", 0).await.unwrap();

        assert_eq!(acks.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            acks.next().await,
            Some(Err(TransportError::NotApplied { offset: 2 }))
        ));
        // Offset 3 is never reported past the refused envelope.
        assert!(acks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_resumes_after_acked_offset() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us"), tagged("t@us"), tagged("t@us")]).await.unwrap();

        let router = Arc::new(EchoRouter::new());
        let connector = Arc::new(LoopbackConnector::new(router.clone(), 4));
        let mut acks = client(log, connector, Duration::from_secs(1)).replicate("t@us", 2).await.unwrap();

        assert_eq!(acks.next().await.unwrap().unwrap(), 3);
        assert_eq!(router.routed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us")]).await.unwrap();

        let mut acks = client(log, Arc::new(SilentPeer), Duration::from_millis(100))
            .replicate("t@us", 0)
            .await
            .unwrap();

        let started = Instant::now();
        assert!(matches!(acks.next().await, Some(Err(TransportError::AckTimeout(_)))));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(acks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_envelopes_are_bounded() {
        let log = Arc::new(InMemoryEventLog::new());
        let events = (0..5).map(|_| tagged("t@us")).collect();
        log.append("eu:1", 0, events).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let replication = ReplicationClient::new("us", log, Arc::new(SilentPeer), 2, Duration::from_secs(5), metrics.clone());
        let _acks = replication.replicate("t@us", 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.envelopes_sent.with_label_values(&["us"]).get(), 2);
        assert_eq!(metrics.envelopes_in_flight.with_label_values(&["us"]).get(), 2);
    }

    #[tokio::test]
    async fn test_text_frames_from_peer_are_ignored() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us")]).await.unwrap();

        let peer = ScriptedPeer(Mutex::new(vec![Frame::text("hello"), Frame::ack(1)]));
        let mut acks = client(log, Arc::new(peer), Duration::from_secs(1)).replicate("t@us", 0).await.unwrap();

        assert_eq!(acks.next().await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_ack_fails_the_stream() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("eu:1", 0, vec![tagged("t@us")]).await.unwrap();

        let peer = ScriptedPeer(Mutex::new(vec![Frame::binary(vec![0xff, 0xff])]));
        let mut acks = client(log, Arc::new(peer), Duration::from_secs(1)).replicate("t@us", 0).await.unwrap();

        assert!(matches!(acks.next().await, Some(Err(TransportError::Decode(_)))));
    }
}
