use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use scylla::client::session::Session;
use scylla::statement::batch::Batch;
use scylla_cdc::consumer::{CDCRow, Consumer, ConsumerFactory, OperationType};
use scylla_cdc::log_reader::{CDCLogReader, CDCLogReaderBuilder};
use tokio::sync::mpsc;

use super::event_log::{EventLog, TagStream};
use crate::error::EventLogError;
use crate::event_sourcing::core::{NewEvent, PersistedEvent};

// ============================================================================
// ScyllaDB Event Log
// ============================================================================
//
// Schema (see `ensure_schema`):
//
//   event_store (aggregate_id, sequence_number) -- CDC enabled
//     event_type, payload blob, produced_at bigint, tags frozen<set<text>>
//
// Responsibilities:
// 1. Append events with a LOGGED batch (single partition, all or none)
// 2. Load event history for aggregates, ordered by sequence number
// 3. Check the expected sequence before writing
// 4. Stream tagged events from the CDC log of `event_store`, in offset
//    order
//
// The aggregate actor is the only writer of its partition, so the
// read-then-write sequence check cannot race with another append.
//
// Offsets are `produced_at` microseconds, kept increasing per aggregate.
// Two aggregates may share an offset, so tag streams resume inclusively:
// events at the resume offset are sent again and acknowledged as
// duplicates instead of being skipped.
//
// The CDC reader runs one consumer per CDC stream concurrently, so rows of
// one tag arrive out of offset order. They are held until every stream has
// certainly read past their offset, then released lowest offset first.
//
// ============================================================================

const TABLE: &str = "event_store";
const TAG_BUFFER: usize = 256;

const CDC_WINDOW: Duration = Duration::from_secs(1);
const CDC_SAFETY_INTERVAL: Duration = Duration::from_secs(2);
const CDC_SLEEP_INTERVAL: Duration = Duration::from_millis(500);
/// Allowance for clock skew between writers and processing delay.
const SETTLE_GRACE: Duration = Duration::from_secs(2);
const RELEASE_TICK: Duration = Duration::from_millis(250);

pub struct ScyllaEventLog {
    session: Arc<Session>,
    keyspace: String,
}

impl ScyllaEventLog {
    pub fn new(session: Arc<Session>, keyspace: &str) -> Self {
        Self {
            session,
            keyspace: keyspace.to_string(),
        }
    }

    /// Create the event table (with CDC) if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        self.session
            .query_unpaged(
                "CREATE TABLE IF NOT EXISTS event_store (
                    aggregate_id text,
                    sequence_number bigint,
                    event_type text,
                    payload blob,
                    produced_at bigint,
                    tags frozen<set<text>>,
                    PRIMARY KEY (aggregate_id, sequence_number)
                ) WITH CLUSTERING ORDER BY (sequence_number ASC)
                  AND cdc = {'enabled': true}",
                &[],
            )
            .await
            .map_err(EventLogError::backend)?;
        Ok(())
    }

    /// Last sequence number and offset of an aggregate, `(0, 0)` when new.
    async fn last_entry(&self, aggregate_id: &str) -> Result<(u64, u64), EventLogError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT sequence_number, produced_at FROM event_store
                 WHERE aggregate_id = ?
                 ORDER BY sequence_number DESC LIMIT 1",
                (aggregate_id,),
            )
            .await
            .map_err(EventLogError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok((0, 0)), // No rows = new aggregate
        };

        match rows_result.maybe_first_row::<(i64, Option<i64>)>() {
            Ok(Some((sequence, produced_at))) => {
                Ok((sequence as u64, produced_at.unwrap_or(0).max(0) as u64))
            }
            Ok(None) => Ok((0, 0)),
            Err(e) => Err(EventLogError::backend(e)),
        }
    }
}

fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// Offsets of one batch: after `last_offset`, consecutive, near `now`.
fn batch_offsets(now: u64, last_offset: u64, count: usize) -> impl Iterator<Item = u64> {
    let first = now.max(last_offset + 1);
    (0..count as u64).map(move |i| first + i)
}

#[async_trait]
impl EventLog for ScyllaEventLog {
    async fn append(
        &self,
        aggregate_id: &str,
        expected: u64,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::EmptyBatch);
        }

        // Check optimistic concurrency
        let (actual, last_offset) = self.last_entry(aggregate_id).await?;
        if actual != expected {
            return Err(EventLogError::SequenceConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual,
            });
        }

        // Prepare batch for atomic write
        let mut batch = Batch::default();
        let mut values: Vec<(String, i64, String, Vec<u8>, i64, Vec<String>)> =
            Vec::with_capacity(events.len());
        let offsets: Vec<u64> = batch_offsets(now_micros(), last_offset, events.len()).collect();
        let mut sequence = expected;

        for (event, offset) in events.into_iter().zip(offsets) {
            sequence += 1;
            batch.append_statement(
                "INSERT INTO event_store (
                    aggregate_id, sequence_number, event_type, payload, produced_at, tags
                ) VALUES (?, ?, ?, ?, ?, ?)",
            );
            values.push((
                aggregate_id.to_string(),
                sequence as i64,
                event.event_type,
                event.payload,
                offset as i64,
                event.tags,
            ));
        }

        self.session
            .batch(&batch, values)
            .await
            .map_err(EventLogError::backend)?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            new_sequence = sequence,
            event_count = sequence - expected,
            "Appended events to event store"
        );

        Ok(sequence)
    }

    async fn replay(&self, aggregate_id: &str) -> Result<Vec<PersistedEvent>, EventLogError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT sequence_number, event_type, payload, produced_at, tags
                 FROM event_store
                 WHERE aggregate_id = ?
                 ORDER BY sequence_number ASC",
                (aggregate_id,),
            )
            .await
            .map_err(EventLogError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(Vec::new()),
        };

        let mut events = Vec::new();
        for row in rows_result
            .rows::<(i64, String, Vec<u8>, i64, Option<Vec<String>>)>()
            .map_err(EventLogError::backend)?
        {
            let (sequence_number, event_type, payload, produced_at, tags) =
                row.map_err(EventLogError::backend)?;
            events.push(PersistedEvent {
                aggregate_id: aggregate_id.to_string(),
                sequence_number: sequence_number as u64,
                offset: produced_at as u64,
                event_type,
                payload,
                tags: tags.unwrap_or_default(),
            });
        }

        tracing::debug!("Loaded {} events for aggregate {}", events.len(), aggregate_id);
        Ok(events)
    }

    async fn last_sequence(&self, aggregate_id: &str) -> Result<u64, EventLogError> {
        Ok(self.last_entry(aggregate_id).await?.0)
    }

    async fn events_by_tag(&self, tag: &str, after_offset: u64) -> Result<TagStream, EventLogError> {
        let (tx, rows) = mpsc::channel(TAG_BUFFER);
        let factory = Arc::new(TagConsumerFactory {
            tag: tag.to_string(),
            after_offset,
            tx,
        });

        // Offsets are microseconds since the epoch; start the CDC window there.
        let (reader, handle) = CDCLogReaderBuilder::new()
            .session(self.session.clone())
            .keyspace(&self.keyspace)
            .table_name(TABLE)
            .start_timestamp(chrono::Duration::microseconds(after_offset as i64))
            .window_size(CDC_WINDOW)
            .safety_interval(CDC_SAFETY_INTERVAL)
            .sleep_interval(CDC_SLEEP_INTERVAL)
            .consumer_factory(factory)
            .build()
            .await
            .map_err(|e| EventLogError::backend(e.to_string()))?;

        let tag_name = tag.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, tag = %tag_name, "CDC reader for tag stream failed");
            }
        });

        let (ordered_tx, rx) = mpsc::channel(TAG_BUFFER);
        let settle = CDC_WINDOW + CDC_SAFETY_INTERVAL + CDC_SLEEP_INTERVAL + SETTLE_GRACE;
        tokio::spawn(release_in_offset_order(rows, ordered_tx, settle, tag.to_string()));

        tracing::info!(tag = %tag, after_offset, "🔄 Streaming tagged events from CDC log");

        let stream = stream::unfold((rx, TagReader(reader)), |(mut rx, reader)| async move {
            rx.recv().await.map(|event| (Ok(event), (rx, reader)))
        });
        Ok(stream.boxed())
    }
}

/// Stops the CDC reader when the tag stream is dropped.
struct TagReader(CDCLogReader);

impl Drop for TagReader {
    fn drop(&mut self) {
        self.0.stop();
    }
}

// ============================================================================
// Offset ordering across CDC streams
// ============================================================================

type OrderKey = (u64, String, u64);

fn order_key(event: &PersistedEvent) -> OrderKey {
    (event.offset, event.aggregate_id.clone(), event.sequence_number)
}

/// Rows held back until the watermark passes them.
#[derive(Default)]
struct OffsetOrder {
    held: BTreeMap<OrderKey, PersistedEvent>,
    released: Option<OrderKey>,
}

impl OffsetOrder {
    fn hold(&mut self, event: PersistedEvent) -> bool {
        let key = order_key(&event);
        let late = self.released.as_ref().is_some_and(|released| &key < released);
        self.held.insert(key, event);
        !late
    }

    /// Remove and return, lowest first, every row with an offset at or
    /// below `watermark`.
    fn release(&mut self, watermark: u64) -> Vec<PersistedEvent> {
        let mut ready = Vec::new();
        while let Some(entry) = self.held.first_entry() {
            if entry.key().0 > watermark {
                break;
            }
            let (key, event) = entry.remove_entry();
            self.released = Some(key);
            ready.push(event);
        }
        ready
    }
}

async fn release_in_offset_order(
    mut rows: mpsc::Receiver<PersistedEvent>,
    out: mpsc::Sender<PersistedEvent>,
    settle: Duration,
    tag: String,
) {
    let settle_micros = settle.as_micros() as u64;
    let mut order = OffsetOrder::default();
    let mut tick = tokio::time::interval(RELEASE_TICK);

    loop {
        let watermark = tokio::select! {
            row = rows.recv() => match row {
                Some(event) => {
                    let (offset, aggregate_id) = (event.offset, event.aggregate_id.clone());
                    if !order.hold(event) {
                        tracing::warn!(
                            tag = %tag,
                            offset,
                            aggregate_id = %aggregate_id,
                            "CDC row arrived after later offsets were released"
                        );
                    }
                    continue;
                }
                // The reader stopped; nothing older can arrive.
                None => u64::MAX,
            },
            _ = tick.tick() => now_micros().saturating_sub(settle_micros),
        };

        for event in order.release(watermark) {
            if out.send(event).await.is_err() {
                return;
            }
        }
        if watermark == u64::MAX {
            return;
        }
    }
}

// ============================================================================
// CDC consumer feeding a tag stream
// ============================================================================

struct TagConsumer {
    tag: String,
    after_offset: u64,
    tx: mpsc::Sender<PersistedEvent>,
}

impl TagConsumer {
    fn extract(&self, data: &CDCRow<'_>) -> anyhow::Result<Option<PersistedEvent>> {
        match data.operation {
            OperationType::RowInsert | OperationType::RowUpdate => {}
            _ => return Ok(None),
        }

        let tags: Vec<String> = data
            .get_value("tags")
            .as_ref()
            .and_then(|v| v.as_set())
            .map(|set| set.iter().filter_map(|t| t.as_text().cloned()).collect())
            .unwrap_or_default();
        if !tags.iter().any(|t| t == &self.tag) {
            return Ok(None);
        }

        let aggregate_id = data
            .get_value("aggregate_id")
            .as_ref()
            .and_then(|v| v.as_text())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid aggregate_id"))?;
        let sequence_number = data
            .get_value("sequence_number")
            .as_ref()
            .and_then(|v| v.as_bigint())
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid sequence_number"))?;
        let event_type = data
            .get_value("event_type")
            .as_ref()
            .and_then(|v| v.as_text())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid event_type"))?;
        let payload = data
            .get_value("payload")
            .as_ref()
            .and_then(|v| v.as_blob())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid payload"))?;
        let produced_at = data
            .get_value("produced_at")
            .as_ref()
            .and_then(|v| v.as_bigint())
            .ok_or_else(|| anyhow::anyhow!("Missing or invalid produced_at"))?;

        // Inclusive: another aggregate may share the resume offset.
        if (produced_at as u64) < self.after_offset {
            return Ok(None);
        }

        Ok(Some(PersistedEvent {
            aggregate_id,
            sequence_number: sequence_number as u64,
            offset: produced_at as u64,
            event_type,
            payload,
            tags,
        }))
    }
}

#[async_trait]
impl Consumer for TagConsumer {
    async fn consume_cdc(&mut self, data: CDCRow<'_>) -> anyhow::Result<()> {
        if let Some(event) = self.extract(&data)? {
            tracing::debug!(
                aggregate_id = %event.aggregate_id,
                sequence_number = event.sequence_number,
                tag = %self.tag,
                "Received tagged event from CDC stream"
            );
            self.tx
                .send(event)
                .await
                .map_err(|_| anyhow::anyhow!("tag stream subscriber is gone"))?;
        }
        Ok(())
    }
}

struct TagConsumerFactory {
    tag: String,
    after_offset: u64,
    tx: mpsc::Sender<PersistedEvent>,
}

#[async_trait]
impl ConsumerFactory for TagConsumerFactory {
    async fn new_consumer(&self) -> Box<dyn Consumer> {
        Box::new(TagConsumer {
            tag: self.tag.clone(),
            after_offset: self.after_offset,
            tx: self.tx.clone(),
        })
    }
}
