// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// This module contains GENERIC persistence infrastructure for event sourcing.
// All components work with ANY aggregate/event type.
//
// ============================================================================

pub mod event_log;
pub mod memory;
pub mod offsets;
pub mod scylla_log;

pub use event_log::{EventLog, TagStream};
pub use memory::InMemoryEventLog;
pub use offsets::{InMemoryOffsetStore, OffsetStore, ScyllaOffsetStore};
pub use scylla_log::ScyllaEventLog;
