// ============================================================================
// Cross-Datacenter Replication
// ============================================================================
//
// - classifier   - region sets, replication policy hooks, tag naming
// - role         - replication roles and the recovery rule
// - coordinator  - role state machine wrapping the aggregate engine
// - id           - region-scoped aggregate identities
// - wire         - protobuf envelope / ack / frame messages
//
// ============================================================================

pub mod classifier;
pub mod coordinator;
pub mod id;
pub mod role;
pub mod wire;

pub use classifier::{
    replication_tag, require_local_owner, DatacenterClassifier, RegionSet, ReplicationPolicy,
};
pub use coordinator::{CoordinatorSettings, EnvelopeReply, ReplicationCoordinator};
pub use id::AggregateId;
pub use role::{determine_role, ReplicationRole};
pub use wire::{Ack, EventEnvelope, Frame};
