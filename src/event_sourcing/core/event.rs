use serde::{de::DeserializeOwned, Serialize};

use crate::error::EventLogError;

// ============================================================================
// Domain Events & Persisted Records
// ============================================================================
//
// Domain events are typed values owned by an aggregate. The event log only
// ever sees their serialized form (`NewEvent` going in, `PersistedEvent`
// coming out), which keeps the log generic over every aggregate type.
//
// ============================================================================

/// Generic Domain Event trait
///
/// All domain events must implement this trait to be folded by an aggregate
/// and stored in an event log.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable name of the concrete variant, e.g. `"OrderCreated"`.
    fn event_type(&self) -> &'static str;
}

/// An event about to be appended. Sequence numbers are assigned by the log
/// from the expected sequence of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub tags: Vec<String>,
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub aggregate_id: String,
    pub sequence_number: u64,
    /// Position of the event in this region's log, increasing per aggregate
    /// and used as the resumable offset of tag subscriptions. Events of
    /// different aggregates may share an offset in some logs.
    pub offset: u64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub tags: Vec<String>,
}

impl PersistedEvent {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ============================================================================
// Event Serialization Helpers
// ============================================================================

pub fn serialize_event<E: DomainEvent>(event: &E) -> Result<Vec<u8>, EventLogError> {
    Ok(serde_json::to_vec(event)?)
}

pub fn deserialize_event<E: DomainEvent>(bytes: &[u8]) -> Result<E, EventLogError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a domain event into an appendable record.
pub fn to_new_event<E: DomainEvent>(event: &E, tags: Vec<String>) -> Result<NewEvent, EventLogError> {
    Ok(NewEvent {
        event_type: event.event_type().to_string(),
        payload: serialize_event(event)?,
        tags,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct TestEvent {
        data: String,
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "TestEvent"
        }
    }

    #[test]
    fn test_new_event_carries_type_and_tags() {
        let event = TestEvent { data: "test".to_string() };
        let record = to_new_event(&event, vec!["order@eu".to_string()]).unwrap();

        assert_eq!(record.event_type, "TestEvent");
        assert_eq!(record.tags, vec!["order@eu".to_string()]);
        let back: TestEvent = deserialize_event(&record.payload).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_deserialize_garbage_is_an_error() {
        let result = deserialize_event::<TestEvent>(b"not json");
        assert!(matches!(result, Err(EventLogError::Serialization(_))));
    }

    #[test]
    fn test_has_tag() {
        let record = PersistedEvent {
            aggregate_id: "a".into(),
            sequence_number: 1,
            offset: 10,
            event_type: "TestEvent".into(),
            payload: vec![],
            tags: vec!["x".into(), "y".into()],
        };
        assert!(record.has_tag("y"));
        assert!(!record.has_tag("z"));
    }
}
