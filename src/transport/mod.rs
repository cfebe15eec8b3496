// ============================================================================
// Datacenter Transport
// ============================================================================
//
// One logical duplex channel per (local region -> peer region) link:
//
//   client: tag stream -> EventEnvelope frames -> ... -> Ack frames -> offsets
//   server: EventEnvelope frames -> router (bounded) -> Ack frames
//
// Frames are binary; text frames are logged and skipped on both sides.
//
// ============================================================================

pub mod client;
pub mod server;

use futures_util::stream::BoxStream;

use crate::error::TransportError;
use crate::replication::Frame;

/// Frames received from the other side of a channel.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

pub use client::{
    AckStream, DuplexConnector, GrpcConnector, LoopbackConnector, ReplicationClient,
};
pub use server::{serve, serve_channel, EnvelopeRouter, ReplicationService};
