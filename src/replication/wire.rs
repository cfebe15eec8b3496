use prost::Message;

use crate::error::TransportError;
use crate::event_sourcing::PersistedEvent;

// ============================================================================
// Wire Format
// ============================================================================
//
// Generated from proto/replication.proto:
//   EventEnvelope { aggregate_id, sequence_number, timestamp, event }
//   Ack           { offset }
//   Frame         { oneof payload { bytes binary; string text } }
//
// One envelope or one ack per binary frame.
//
// ============================================================================

pub mod proto {
    tonic::include_proto!("dc_replication.v1");
}

pub use proto::frame::Payload;
pub use proto::{Ack, EventEnvelope, Frame};

/// Encoded descriptor set, served through gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("replication_descriptor");

impl EventEnvelope {
    /// The envelope carrying a locally persisted event to another region.
    pub fn from_persisted(event: &PersistedEvent) -> Self {
        Self {
            aggregate_id: event.aggregate_id.clone(),
            sequence_number: event.sequence_number,
            timestamp: event.offset,
            event: event.payload.clone(),
        }
    }
}

impl Frame {
    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            payload: Some(Payload::Binary(bytes)),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Some(Payload::Text(text.into())),
        }
    }

    pub fn envelope(envelope: &EventEnvelope) -> Self {
        Self::binary(envelope.encode_to_vec())
    }

    pub fn ack(offset: u64) -> Self {
        Self::binary(Ack { offset }.encode_to_vec())
    }

    /// Bytes of a binary frame. `None` for text and empty frames.
    pub fn into_binary(self) -> Option<Vec<u8>> {
        match self.payload {
            Some(Payload::Binary(bytes)) => Some(bytes),
            Some(Payload::Text(text)) => {
                tracing::warn!(text = %text, "Ignoring text frame on replication channel");
                None
            }
            None => {
                tracing::warn!("Ignoring empty frame on replication channel");
                None
            }
        }
    }
}

pub fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope, TransportError> {
    Ok(EventEnvelope::decode(bytes)?)
}

pub fn decode_ack(bytes: &[u8]) -> Result<Ack, TransportError> {
    Ok(Ack::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_takes_offset_as_timestamp() {
        let persisted = PersistedEvent {
            aggregate_id: "eu:1".into(),
            sequence_number: 4,
            offset: 981,
            event_type: "OrderConfirmed".into(),
            payload: b"{}".to_vec(),
            tags: vec!["order@us".into()],
        };
        let envelope = EventEnvelope::from_persisted(&persisted);
        assert_eq!(envelope.timestamp, 981);
        assert_eq!(envelope.sequence_number, 4);

        let bytes = Frame::envelope(&envelope).into_binary().unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_text_frames_carry_no_binary_payload() {
        assert_eq!(Frame::text("hello").into_binary(), None);
        assert_eq!(Frame { payload: None }.into_binary(), None);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let result = decode_ack(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(TransportError::Decode(_))));
    }
}
