use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::replication::wire::proto::datacenter_replication_server::{
    DatacenterReplication, DatacenterReplicationServer,
};
use crate::replication::wire::{decode_envelope, FILE_DESCRIPTOR_SET};
use crate::replication::{EventEnvelope, Frame};

// ============================================================================
// Replication Server
// ============================================================================
//
// For every inbound channel:
// 1. Skip text frames
// 2. Decode each binary frame into an EventEnvelope
// 3. Route it to the local aggregate, at most `max_in_flight` at a time
// 4. Answer with an Ack frame carrying the applied offset (0 = undeliverable)
//
// Acks leave in the order envelopes arrived. A frame that does not decode
// fails the channel.
//
// ============================================================================

/// Delivers an inbound envelope to the aggregate it names.
#[async_trait]
pub trait EnvelopeRouter: Send + Sync + 'static {
    /// The acknowledged offset, or 0 when the envelope was not applied.
    async fn route(&self, envelope: EventEnvelope) -> u64;
}

/// Serve one inbound channel, producing its outbound (ack) frames.
pub fn serve_channel<S>(
    inbound: S,
    router: Arc<dyn EnvelopeRouter>,
    max_in_flight: usize,
) -> impl Stream<Item = Result<Frame, TransportError>> + Send + 'static
where
    S: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
{
    inbound
        .filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_binary().map(Ok),
                Err(err) => Some(Err(err)),
            }
        })
        .map(move |bytes: Result<Vec<u8>, TransportError>| {
            let router = router.clone();
            async move {
                let envelope = decode_envelope(&bytes?)?;
                let offset = router.route(envelope).await;
                Ok(Frame::ack(offset))
            }
        })
        .buffered(max_in_flight.max(1))
}

pub struct ReplicationService {
    router: Arc<dyn EnvelopeRouter>,
    max_in_flight: usize,
    metrics: Arc<Metrics>,
}

impl ReplicationService {
    pub fn new(router: Arc<dyn EnvelopeRouter>, max_in_flight: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            router,
            max_in_flight,
            metrics,
        }
    }
}

fn to_status(err: TransportError) -> Status {
    match err {
        TransportError::Status(status) => status,
        TransportError::Decode(e) => Status::invalid_argument(format!("cannot decode frame: {e}")),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl DatacenterReplication for ReplicationService {
    type ReplicateStream = Pin<Box<dyn Stream<Item = Result<Frame, Status>> + Send + 'static>>;

    async fn replicate(
        &self,
        request: Request<Streaming<Frame>>,
    ) -> Result<Response<Self::ReplicateStream>, Status> {
        tracing::info!(remote = ?request.remote_addr(), "📥 Inbound replication channel opened");
        self.metrics.grpc_streams.inc();

        let inbound = request
            .into_inner()
            .map(|frame| frame.map_err(TransportError::from));
        let outbound = serve_channel(inbound, self.router.clone(), self.max_in_flight).map(|ack| {
            ack.map_err(|err| {
                tracing::warn!(error = %err, "Replication channel failed");
                to_status(err)
            })
        });

        Ok(Response::new(Box::pin(outbound)))
    }
}

/// Run the gRPC server: replication, health and reflection services.
pub async fn serve(addr: SocketAddr, service: ReplicationService) -> anyhow::Result<()> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<DatacenterReplicationServer<ReplicationService>>()
        .await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    tracing::info!("🌐 Replication gRPC server listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(reflection)
        .add_service(DatacenterReplicationServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use prost::Message;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::replication::wire::{decode_ack, Ack};

    /// Acks `timestamp` for sequence numbers it accepts, 0 otherwise.
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        delay: Duration,
    }

    #[async_trait]
    impl EnvelopeRouter for Recorder {
        async fn route(&self, envelope: EventEnvelope) -> u64 {
            tokio::time::sleep(self.delay).await;
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(envelope.sequence_number);
            }
            if envelope.sequence_number == 99 {
                0
            } else {
                envelope.timestamp
            }
        }
    }

    fn frame(sequence: u64) -> Result<Frame, TransportError> {
        Ok(Frame::envelope(&EventEnvelope {
            aggregate_id: "eu:1".into(),
            sequence_number: sequence,
            timestamp: sequence * 10,
            event: b"{}".to_vec(),
        }))
    }

    fn offsets(frames: Vec<Result<Frame, TransportError>>) -> Vec<u64> {
        frames
            .into_iter()
            .map(|f| decode_ack(&f.unwrap().into_binary().unwrap()).unwrap().offset)
            .collect()
    }

    #[tokio::test]
    async fn test_each_envelope_gets_an_ack_in_order() {
        let router = Arc::new(Recorder { seen: Mutex::new(vec![]), delay: Duration::ZERO });
        let inbound = stream::iter(vec![frame(1), frame(2), frame(99)]);

        let acks: Vec<_> = serve_channel(inbound, router.clone(), 4).collect().await;
        assert_eq!(offsets(acks), vec![10, 20, 0]);
    }

    #[tokio::test]
    async fn test_text_frames_are_ignored() {
        let router = Arc::new(Recorder { seen: Mutex::new(vec![]), delay: Duration::ZERO });
        let inbound = stream::iter(vec![Ok(Frame::text("ping")), frame(1), Ok(Frame::text("pong"))]);

        let acks: Vec<_> = serve_channel(inbound, router.clone(), 4).collect().await;
        assert_eq!(offsets(acks), vec![10]);
        assert_eq!(*router.seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_undecodable_frame_fails_the_channel() {
        let router = Arc::new(Recorder { seen: Mutex::new(vec![]), delay: Duration::ZERO });
        let garbage = Ok(Frame::binary(vec![0xff, 0xff, 0xff]));

        let mut acks = Box::pin(serve_channel(stream::iter(vec![garbage]), router, 4));
        assert!(matches!(acks.next().await, Some(Err(TransportError::Decode(_)))));
    }

    #[tokio::test]
    async fn test_routing_runs_up_to_max_in_flight_concurrently() {
        let router = Arc::new(Recorder { seen: Mutex::new(vec![]), delay: Duration::from_millis(100) });
        let inbound = stream::iter((1..=4).map(frame).collect::<Vec<_>>());

        let started = tokio::time::Instant::now();
        let acks: Vec<_> = serve_channel(inbound, router, 4).collect().await;
        assert_eq!(acks.len(), 4);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_ack_frames_decode_to_offsets() {
        let bytes = Frame::ack(77).into_binary().unwrap();
        assert_eq!(Ack::decode(bytes.as_slice()).unwrap().offset, 77);
    }
}
