// ============================================================================
// dc_replication
// ============================================================================
//
// Event-sourced aggregates replicated across datacenters:
//
//   command -> AggregateRegistry -> aggregate actor (single writer)
//           -> ReplicationCoordinator (role gating) -> AggregateEngine
//           -> EventLog (tagged per follower region)
//
//   EventLog tag stream -> ReplicationLink -> duplex channel -> peer
//           -> AggregateRegistry -> replica applies in sequence -> Ack
//
// ============================================================================

pub mod actors;
pub mod config;
pub mod domain;
pub mod error;
pub mod event_sourcing;
pub mod metrics;
pub mod replication;
pub mod transport;
pub mod utils;
