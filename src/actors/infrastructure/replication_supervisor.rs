use std::time::Duration;

use actix::prelude::*;
use kameo::actor::ActorRef;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::health_monitor::{GetSystemHealth, HealthMonitorActor};
use super::replication_link::ReplicationLink;
use crate::actors::core::HealthStatus;

// ============================================================================
// Replication Supervisor - Owns the Outbound Links
// ============================================================================
//
// Responsibilities:
// - Start one ReplicationLink task per (aggregate type, peer region)
// - Periodically log system health from the HealthMonitorActor
// - Abort every link on shutdown
//
// Actor Hierarchy:
//   ReplicationSupervisor (actix)
//   ├── ReplicationLink "order@us"   (tokio task, restarts itself)
//   ├── ReplicationLink "order@ap"
//   └── HealthMonitorActor           (kameo, shared)
//
// ============================================================================

pub struct ReplicationSupervisor {
    pending: Vec<ReplicationLink>,
    running: Vec<RunningLink>,
    health: Option<ActorRef<HealthMonitorActor>>,
    check_interval: Duration,
}

struct RunningLink {
    peer: String,
    tag: String,
    handle: JoinHandle<()>,
}

impl ReplicationSupervisor {
    pub fn new(links: Vec<ReplicationLink>) -> Self {
        Self {
            pending: links,
            running: Vec::new(),
            health: None,
            check_interval: Duration::from_secs(30),
        }
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>, check_interval: Duration) -> Self {
        self.health = Some(health);
        self.check_interval = check_interval;
        self
    }

    fn start_links(&mut self) {
        for link in std::mem::take(&mut self.pending) {
            let peer = link.peer().to_string();
            let tag = link.tag().to_string();
            let span = tracing::info_span!("replication_link", peer = %peer, tag = %tag);
            let handle = tokio::spawn(link.run().instrument(span));

            tracing::info!(peer = %peer, tag = %tag, "🔗 Replication link started");
            self.running.push(RunningLink { peer, tag, handle });
        }
    }
}

impl Actor for ReplicationSupervisor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(links = self.pending.len(), "🎯 ReplicationSupervisor started");
        self.start_links();

        let Some(health) = self.health.clone() else {
            return;
        };
        ctx.run_interval(self.check_interval, move |_act, _ctx| {
            let health = health.clone();
            actix::spawn(async move {
                match health.ask(GetSystemHealth).await {
                    Ok(report) => match report.overall_status {
                        HealthStatus::Healthy => tracing::debug!("System health check: Healthy"),
                        HealthStatus::Degraded(ref reason) => {
                            tracing::warn!(reason = %reason, "System health check: Degraded")
                        }
                        HealthStatus::Unhealthy(ref reason) => {
                            tracing::error!(reason = %reason, "System health check: Unhealthy")
                        }
                    },
                    Err(e) => tracing::error!(error = ?e, "Failed to get system health"),
                }
            });
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        tracing::info!("🛑 ReplicationSupervisor stopping, aborting links");
        for link in &self.running {
            link.handle.abort();
        }
        Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("🛑 ReplicationSupervisor stopped");
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

impl Handler<Shutdown> for ReplicationSupervisor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        tracing::info!("Received shutdown signal");
        ctx.stop();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub peer: String,
    pub tag: String,
    pub running: bool,
}

#[derive(Message)]
#[rtype(result = "Vec<LinkInfo>")]
pub struct GetLinks;

impl Handler<GetLinks> for ReplicationSupervisor {
    type Result = MessageResult<GetLinks>;

    fn handle(&mut self, _msg: GetLinks, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(
            self.running
                .iter()
                .map(|link| LinkInfo {
                    peer: link.peer.clone(),
                    tag: link.tag.clone(),
                    running: !link.handle.is_finished(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::actors::registry::AggregateRegistry;
    use crate::event_sourcing::{InMemoryEventLog, InMemoryOffsetStore, OffsetStore};
    use crate::metrics::Metrics;
    use crate::replication::coordinator::tests::{regions, settings, Register, RegisterCommand};
    use crate::replication::ReplicationRole;
    use crate::transport::{LoopbackConnector, ReplicationClient};

    fn region(log: Arc<InMemoryEventLog>, local: &str) -> AggregateRegistry<Register> {
        AggregateRegistry::new(settings(log, local), Duration::from_secs(60), Duration::from_secs(5))
    }

    #[actix::test]
    async fn test_link_replicates_primary_writes_to_peer() {
        let eu_log = Arc::new(InMemoryEventLog::new());
        let eu = region(eu_log.clone(), "eu");
        let us = region(Arc::new(InMemoryEventLog::new()), "us");

        eu.execute("eu:1", RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();
        eu.execute("eu:1", RegisterCommand::Write("a".into())).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let client = ReplicationClient::new(
            "us",
            eu_log.clone(),
            Arc::new(LoopbackConnector::new(Arc::new(us.clone()), 4)),
            4,
            Duration::from_secs(1),
            metrics.clone(),
        );
        let link = ReplicationLink::new("register@us", client, offsets.clone(), metrics);
        let supervisor = ReplicationSupervisor::new(vec![link]).start();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let replica = us.snapshot("eu:1").await.unwrap();
        assert_eq!(replica.last_sequence, 2);
        assert_eq!(replica.state.values, vec!["a".to_string()]);
        assert_eq!(replica.role, ReplicationRole::Replica { primary: Some("eu".into()) });
        assert_eq!(offsets.load("register@us").await.unwrap(), 2);

        // Writes made after the link is up follow.
        eu.execute("eu:1", RegisterCommand::Write("b".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(us.snapshot("eu:1").await.unwrap().last_sequence, 3);

        let links = supervisor.send(GetLinks).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].running);

        supervisor.send(Shutdown).await.unwrap();
    }

    #[actix::test]
    async fn test_link_resumes_after_stored_offset() {
        let eu_log = Arc::new(InMemoryEventLog::new());
        let eu = region(eu_log.clone(), "eu");
        let us = region(Arc::new(InMemoryEventLog::new()), "us");

        eu.execute("eu:1", RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();
        eu.execute("eu:2", RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();

        // eu:1 was acknowledged before a restart.
        let offsets = Arc::new(InMemoryOffsetStore::new());
        offsets.save("register@us", 1).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let client = ReplicationClient::new(
            "us",
            eu_log,
            Arc::new(LoopbackConnector::new(Arc::new(us.clone()), 4)),
            4,
            Duration::from_secs(1),
            metrics.clone(),
        );
        let supervisor = ReplicationSupervisor::new(vec![ReplicationLink::new(
            "register@us",
            client,
            offsets.clone(),
            metrics,
        )])
        .start();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(us.snapshot("eu:2").await.unwrap().last_sequence, 1);
        assert_eq!(us.snapshot("eu:1").await.unwrap().last_sequence, 0);
        assert_eq!(offsets.load("register@us").await.unwrap(), 2);

        supervisor.send(Shutdown).await.unwrap();
    }
}
