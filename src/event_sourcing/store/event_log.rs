use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::EventLogError;
use crate::event_sourcing::core::{NewEvent, PersistedEvent};

// ============================================================================
// Event Log - Pluggable Append-Only Storage
// ============================================================================
//
// Responsibilities:
// 1. Append a batch of events atomically (all or none), guarded by the
//    expected last sequence number of the aggregate
// 2. Replay an aggregate's history in sequence order
// 3. Stream events carrying a tag, resumable from an offset
//
// ============================================================================

pub type TagStream = BoxStream<'static, Result<PersistedEvent, EventLogError>>;

#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append `events` with sequence numbers `expected + 1 ..`.
    ///
    /// Fails with [`EventLogError::SequenceConflict`] when the aggregate's
    /// last sequence differs from `expected`. Returns the new last sequence.
    async fn append(
        &self,
        aggregate_id: &str,
        expected: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError>;

    /// The full history of an aggregate, by increasing sequence number.
    async fn replay(&self, aggregate_id: &str) -> Result<Vec<PersistedEvent>, EventLogError>;

    /// Highest sequence number of the aggregate (0 when it has no events).
    async fn last_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError>;

    /// Live stream of every event tagged `tag` after `after_offset`, in
    /// offset order.
    ///
    /// Logs with unique offsets start strictly after `after_offset`. Logs
    /// where aggregates can share an offset also send the events at
    /// `after_offset` again; receivers acknowledge those as duplicates.
    async fn events_by_tag(&self, tag: &str, after_offset: u64) -> Result<TagStream, EventLogError>;
}
