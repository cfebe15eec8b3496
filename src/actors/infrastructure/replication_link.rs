use std::sync::Arc;

use futures_util::StreamExt;
use kameo::actor::ActorRef;

use super::health_monitor::{HealthMonitorActor, UpdateHealth};
use crate::actors::core::HealthStatus;
use crate::error::TransportError;
use crate::event_sourcing::OffsetStore;
use crate::metrics::Metrics;
use crate::transport::ReplicationClient;
use crate::utils::{retry_on_transient, Backoff, RetryConfig};

// ============================================================================
// Replication Link - One Outbound Peer Channel
// ============================================================================
//
// Lifecycle (repeats until the link task is aborted):
// 1. Load the last acknowledged offset for the link's tag
// 2. Open a channel to the peer, retrying transient failures
// 3. Persist every acknowledged offset as it arrives
// 4. When the channel fails, back off and start again from step 1
//
// An envelope the peer did not apply fails the channel before any later
// offset is saved, so the restart sends it again. Backoff resets whenever
// a channel made progress.
//
// ============================================================================

pub struct ReplicationLink {
    tag: String,
    client: ReplicationClient,
    offsets: Arc<dyn OffsetStore>,
    health: Option<ActorRef<HealthMonitorActor>>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
}

impl ReplicationLink {
    pub fn new(
        tag: impl Into<String>,
        client: ReplicationClient,
        offsets: Arc<dyn OffsetStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tag: tag.into(),
            client,
            offsets,
            health: None,
            metrics,
            retry: RetryConfig::link(),
        }
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn peer(&self) -> &str {
        self.client.peer()
    }

    pub async fn run(self) {
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            let mut progressed = false;
            let outcome = self.run_channel(&mut progressed).await;
            if progressed {
                backoff.reset();
            }

            match outcome {
                Ok(()) => {
                    tracing::info!(peer = %self.peer(), tag = %self.tag, "Replication channel ended");
                }
                Err(err) => {
                    tracing::warn!(peer = %self.peer(), tag = %self.tag, error = %err, "⚠️ Replication channel failed");
                    self.report(HealthStatus::Degraded(err.to_string())).await;
                }
            }

            self.metrics.link_restarts.with_label_values(&[self.peer()]).inc();
            let Some(delay) = backoff.next_delay() else {
                self.report(HealthStatus::Unhealthy("giving up on peer".to_string())).await;
                tracing::error!(peer = %self.peer(), tag = %self.tag, "❌ Replication link stopped");
                return;
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_channel(&self, progressed: &mut bool) -> Result<(), TransportError> {
        let from = self.offsets.load(&self.tag).await?;

        let operation = format!("replicate:{}", self.tag);
        let client = &self.client;
        let tag = self.tag.as_str();
        let mut acks = retry_on_transient(&operation, RetryConfig::default(), Some(&self.metrics), |_| {
            client.replicate(tag, from)
        })
        .await
        .into_result()?;

        self.report(HealthStatus::Healthy).await;

        while let Some(ack) = acks.next().await {
            let offset = ack?;
            self.offsets.save(&self.tag, offset).await?;
            *progressed = true;
            tracing::trace!(peer = %self.peer(), tag = %self.tag, offset, "✅ Offset acknowledged");
        }
        Ok(())
    }

    async fn report(&self, status: HealthStatus) {
        let Some(health) = &self.health else {
            return;
        };
        let _ = health
            .tell(UpdateHealth {
                component: format!("link:{}", self.tag),
                status,
                details: Some(format!("peer {}", self.peer())),
            })
            .send()
            .await;
    }
}
