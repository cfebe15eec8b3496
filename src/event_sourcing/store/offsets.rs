use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use scylla::client::session::Session;
use tokio::sync::RwLock;

use crate::error::EventLogError;

// ============================================================================
// Offset Store - Resumable Replication Progress
// ============================================================================
//
// Holds the acknowledged high-water mark per replication tag. An outbound
// link resumes its tag subscription strictly after the stored offset, so a
// crash between "acknowledged" and "saved" re-sends a few envelopes; the
// receiving side treats those as duplicates.
//
// Saved offsets never move backwards.
//
// ============================================================================

#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Last acknowledged offset for `tag` (0 = start from the beginning).
    async fn load(&self, tag: &str) -> Result<u64, EventLogError>;

    async fn save(&self, tag: &str, offset: u64) -> Result<(), EventLogError>;
}

#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: RwLock<HashMap<String, u64>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, tag: &str) -> Result<u64, EventLogError> {
        Ok(self.offsets.read().await.get(tag).copied().unwrap_or(0))
    }

    async fn save(&self, tag: &str, offset: u64) -> Result<(), EventLogError> {
        let mut offsets = self.offsets.write().await;
        let current = offsets.entry(tag.to_string()).or_insert(0);
        *current = (*current).max(offset);
        Ok(())
    }
}

/// Offsets kept in the `replication_offsets` table, one row per tag.
pub struct ScyllaOffsetStore {
    session: Arc<Session>,
}

impl ScyllaOffsetStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        self.session
            .query_unpaged(
                "CREATE TABLE IF NOT EXISTS replication_offsets (
                    tag text PRIMARY KEY,
                    acked_offset bigint,
                    updated_at timestamp
                )",
                &[],
            )
            .await
            .map_err(EventLogError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for ScyllaOffsetStore {
    async fn load(&self, tag: &str) -> Result<u64, EventLogError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT acked_offset FROM replication_offsets WHERE tag = ?",
                (tag,),
            )
            .await
            .map_err(EventLogError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(0),
        };

        match rows_result.maybe_first_row::<(Option<i64>,)>() {
            Ok(Some((Some(offset),))) => Ok(offset.max(0) as u64),
            Ok(_) => Ok(0),
            Err(e) => Err(EventLogError::backend(e)),
        }
    }

    async fn save(&self, tag: &str, offset: u64) -> Result<(), EventLogError> {
        // Acks arrive in increasing order per link; a stale write after a
        // restart is corrected by the next ack.
        let current = self.load(tag).await?;
        if offset <= current {
            return Ok(());
        }

        self.session
            .query_unpaged(
                "INSERT INTO replication_offsets (tag, acked_offset, updated_at) VALUES (?, ?, ?)",
                (tag, offset as i64, chrono::Utc::now()),
            )
            .await
            .map_err(EventLogError::backend)?;

        tracing::debug!(tag = %tag, offset, "Saved replication offset");
        Ok(())
    }
}
