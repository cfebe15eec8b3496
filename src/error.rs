use thiserror::Error;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// - EventLogError:   storage failures (append conflict, backend, codec)
// - CommandError:    everything a command sender can get back instead of a
//                    reply (validation, role, invariant, persistence)
// - EnvelopeError:   failures while applying an inbound replicated event
// - TransportError:  failures of the duplex datacenter channel
//
// Errors never cross aggregate boundaries except through these replies.
//
// ============================================================================

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("sequence conflict for {aggregate_id}: expected {expected}, found {actual}")]
    SequenceConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("cannot append an empty event batch")]
    EmptyBatch,

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event log backend error: {0}")]
    Backend(#[source] BoxError),

    #[error("tag stream lagged behind by {0} events")]
    Lagged(u64),
}

impl EventLogError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        EventLogError::Backend(err.into())
    }
}

/// Why a command produced no reply.
#[derive(Debug, Error)]
pub enum CommandError<E: std::error::Error> {
    /// The handler's validation rejected the command.
    #[error("command rejected: {0}")]
    Rejected(E),

    #[error("no handler in the chain accepts this command")]
    Unhandled,

    /// Retryable: the aggregate has not decided whether it is primary or replica.
    #[error("replication role not yet known, retry later")]
    RoleNotYetKnown,

    #[error("write rejected: this region is not the primary (primary: {primary:?})")]
    NotPrimary { primary: Option<String> },

    #[error("replication invariant violated: {0}")]
    InvariantViolation(String),

    #[error("persisting events failed: {0}")]
    Persistence(#[source] EventLogError),

    #[error("aggregate recovery failed: {0}")]
    Recovery(String),

    #[error("aggregate actor is gone")]
    ActorGone,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolViolation {
    /// Two regions independently created the same identity.
    #[error("received replicated event while primary for {aggregate_id}")]
    EnvelopeForPrimary { aggregate_id: String },

    #[error("envelope for {received} delivered to aggregate {expected}")]
    IdentityMismatch { expected: String, received: String },
}

/// Why an inbound envelope was not acknowledged.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("gap queue full ({0} pending envelopes)")]
    GapQueueFull(usize),

    #[error("cannot decode replicated event: {0}")]
    Decode(String),

    #[error("persisting replicated event failed: {0}")]
    Persistence(#[source] EventLogError),

    #[error("aggregate recovery failed: {0}")]
    Recovery(String),

    #[error("timed out waiting for the aggregate to apply the envelope")]
    Timeout,

    #[error("aggregate actor is gone")]
    ActorGone,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("remote status: {0}")]
    Status(#[from] tonic::Status),

    #[error("cannot decode frame: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("no acknowledgment within {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("peer did not apply the envelope at offset {offset}")]
    NotApplied { offset: u64 },

    #[error("event source failed: {0}")]
    Source(#[from] EventLogError),

    #[error("channel closed")]
    Closed,
}

impl crate::utils::IsTransient for TransportError {
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Status(status) => !matches!(
                status.code(),
                tonic::Code::InvalidArgument | tonic::Code::Unimplemented | tonic::Code::PermissionDenied
            ),
            TransportError::Decode(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::IsTransient;

    #[test]
    fn test_transport_errors_classify_for_retry() {
        assert!(TransportError::Closed.is_transient());
        assert!(TransportError::NotApplied { offset: 7 }.is_transient());
        assert!(TransportError::AckTimeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(TransportError::Status(tonic::Status::unavailable("peer down")).is_transient());
        assert!(!TransportError::Status(tonic::Status::unimplemented("no such service")).is_transient());
    }

    #[test]
    fn test_command_errors_render_the_primary() {
        let err: CommandError<std::fmt::Error> = CommandError::NotPrimary {
            primary: Some("eu".into()),
        };
        assert!(err.to_string().contains("eu"));
    }
}
