use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};

use super::event_log::{EventLog, TagStream};
use crate::error::EventLogError;
use crate::event_sourcing::core::{NewEvent, PersistedEvent};

const TAG_CHANNEL_CAPACITY: usize = 4096;

/// Event log kept in process memory. Used by tests and single-node runs.
pub struct InMemoryEventLog {
    inner: Mutex<Inner>,
    appended: broadcast::Sender<PersistedEvent>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<PersistedEvent>>,
    next_offset: u64,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        let (appended, _) = broadcast::channel(TAG_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            appended,
        }
    }

    /// Number of events stored for `aggregate_id`.
    pub async fn len(&self, aggregate_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.streams.get(aggregate_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        aggregate_id: &str,
        expected: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::EmptyBatch);
        }

        let mut inner = self.inner.lock().await;
        let actual = inner
            .streams
            .get(aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.sequence_number)
            .unwrap_or(0);
        if actual != expected {
            return Err(EventLogError::SequenceConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual,
            });
        }

        let mut sequence = expected;
        let mut persisted = Vec::with_capacity(events.len());
        for event in events {
            sequence += 1;
            inner.next_offset += 1;
            persisted.push(PersistedEvent {
                aggregate_id: aggregate_id.to_string(),
                sequence_number: sequence,
                offset: inner.next_offset,
                event_type: event.event_type,
                payload: event.payload,
                tags: event.tags,
            });
        }

        inner
            .streams
            .entry(aggregate_id.to_string())
            .or_default()
            .extend(persisted.iter().cloned());

        for event in persisted {
            // No subscribers is fine.
            let _ = self.appended.send(event);
        }

        Ok(sequence)
    }

    async fn replay(&self, aggregate_id: &str) -> Result<Vec<PersistedEvent>, EventLogError> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn last_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.sequence_number)
            .unwrap_or(0))
    }

    async fn events_by_tag(&self, tag: &str, after_offset: u64) -> Result<TagStream, EventLogError> {
        // Subscribe under the lock so nothing appended between the snapshot
        // and the subscription is lost.
        let inner = self.inner.lock().await;
        let live = self.appended.subscribe();

        let mut backlog: Vec<PersistedEvent> = inner
            .streams
            .values()
            .flatten()
            .filter(|e| e.offset > after_offset && e.has_tag(tag))
            .cloned()
            .collect();
        backlog.sort_by_key(|e| e.offset);
        drop(inner);

        let high_water = backlog.last().map(|e| e.offset).unwrap_or(after_offset);
        let tag = tag.to_string();

        let live = stream::unfold(Some(live), move |receiver| {
            let tag = tag.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.offset > high_water && event.has_tag(&tag) => {
                            return Some((Ok(event), Some(receiver)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(EventLogError::Lagged(n)), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}
