use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use super::aggregate_actor::{
    run_aggregate, ActorSetup, AggregateMessage, AggregateSnapshot, CommandResult,
};
use crate::error::{CommandError, EnvelopeError};
use crate::event_sourcing::Aggregate;
use crate::replication::{AggregateId, CoordinatorSettings, EventEnvelope};
use crate::transport::EnvelopeRouter;

// ============================================================================
// Aggregate Registry - Routing by Aggregate Identity
// ============================================================================
//
// Responsibilities:
// 1. Route commands, envelopes and state queries to the one live instance
//    of an aggregate, spawning it on first address
// 2. Route inbound envelopes by the identity embedded in the envelope
// 3. Re-route a message whose target mailbox was closed by passivation
// 4. Start a re-activated instance only after its predecessor terminated,
//    so two activations never write the same stream
//
// ============================================================================

const MAILBOX_CAPACITY: usize = 256;
const MAX_ROUTING_ATTEMPTS: usize = 3;

pub struct AggregateRegistry<A: Aggregate> {
    inner: Arc<Inner<A>>,
}

impl<A: Aggregate> Clone for AggregateRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<A: Aggregate> {
    settings: CoordinatorSettings<A>,
    idle_timeout: Duration,
    request_timeout: Duration,
    instances: Mutex<HashMap<String, Instance<A>>>,
    next_generation: AtomicU64,
}

struct Instance<A: Aggregate> {
    generation: u64,
    sender: mpsc::Sender<AggregateMessage<A>>,
    terminated: watch::Receiver<bool>,
}

impl<A: Aggregate> AggregateRegistry<A> {
    pub fn new(settings: CoordinatorSettings<A>, idle_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                idle_timeout,
                request_timeout,
                instances: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create a new aggregate under an identity minted for the local region.
    ///
    /// New replicated aggregates must be created this way; identities chosen
    /// by callers could collide with one minted in another region.
    pub async fn create(&self, command: A::Command) -> Result<(AggregateId, A::Reply), CommandError<A::Error>> {
        let id = AggregateId::generate(&self.inner.settings.local_region);
        let reply = self.execute(id.as_str(), command).await?;
        tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %id, "🆕 Aggregate created");
        Ok((id, reply))
    }

    /// Send a command to an existing aggregate and wait for its reply.
    pub async fn execute(&self, aggregate_id: &str, command: A::Command) -> CommandResult<A> {
        let (reply, rx) = oneshot::channel();
        self.send(aggregate_id, AggregateMessage::Execute { command, reply })
            .await
            .map_err(|_| CommandError::ActorGone)?;
        rx.await.map_err(|_| CommandError::ActorGone)?
    }

    /// Apply an inbound envelope to the aggregate it names.
    ///
    /// Resolves to the acknowledged offset once the envelope is applied (or
    /// recognized as a duplicate).
    pub async fn replicate(&self, envelope: EventEnvelope) -> Result<u64, EnvelopeError> {
        let aggregate_id = envelope.aggregate_id.clone();
        let (reply, rx) = oneshot::channel();
        let routed = async {
            self.send(&aggregate_id, AggregateMessage::Replicate { envelope, reply })
                .await
                .map_err(|_| EnvelopeError::ActorGone)?;
            rx.await.map_err(|_| EnvelopeError::ActorGone)?
        };

        tokio::time::timeout(self.inner.request_timeout, routed)
            .await
            .map_err(|_| EnvelopeError::Timeout)?
    }

    pub async fn snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<AggregateSnapshot<A>, CommandError<A::Error>> {
        let (reply, rx) = oneshot::channel();
        self.send(aggregate_id, AggregateMessage::GetState { reply })
            .await
            .map_err(|_| CommandError::ActorGone)?;
        rx.await.map_err(|_| CommandError::ActorGone)
    }

    /// Number of instances currently registered (live or draining).
    pub fn live_instances(&self) -> usize {
        self.inner.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    async fn send(&self, aggregate_id: &str, mut message: AggregateMessage<A>) -> Result<(), ()> {
        for attempt in 1..=MAX_ROUTING_ATTEMPTS {
            let Some(sender) = self.address(aggregate_id) else {
                return Err(());
            };
            match sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    tracing::debug!(
                        aggregate_id = %aggregate_id,
                        attempt,
                        "Mailbox closed by passivation, re-routing"
                    );
                    message = returned;
                }
            }
        }
        tracing::warn!(aggregate_id = %aggregate_id, "Giving up routing message");
        Err(())
    }

    /// Sender of the live instance, spawning one if needed.
    fn address(&self, aggregate_id: &str) -> Option<mpsc::Sender<AggregateMessage<A>>> {
        let mut instances = self.inner.instances.lock().ok()?;

        let predecessor = match instances.get(aggregate_id) {
            Some(instance) if !instance.sender.is_closed() => return Some(instance.sender.clone()),
            Some(instance) => Some(instance.terminated.clone()),
            None => None,
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let weak: Weak<Inner<A>> = Arc::downgrade(&self.inner);
        let id = aggregate_id.to_string();
        let on_terminated = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut instances) = inner.instances.lock() {
                    // A successor may already own the slot.
                    if instances.get(&id).map(|i| i.generation) == Some(generation) {
                        instances.remove(&id);
                    }
                }
            }
        });

        let setup = ActorSetup {
            id: aggregate_id.to_string(),
            settings: self.inner.settings.clone(),
            idle_timeout: self.inner.idle_timeout,
            predecessor,
            terminated: terminated_tx,
            on_terminated,
        };
        let span = tracing::info_span!(
            "aggregate",
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate_id,
            generation
        );
        tokio::spawn(run_aggregate(setup, rx).instrument(span));

        instances.insert(
            aggregate_id.to_string(),
            Instance {
                generation,
                sender: sender.clone(),
                terminated: terminated_rx,
            },
        );
        Some(sender)
    }
}

#[async_trait]
impl<A: Aggregate> EnvelopeRouter for AggregateRegistry<A> {
    async fn route(&self, envelope: EventEnvelope) -> u64 {
        let aggregate_id = envelope.aggregate_id.clone();
        let sequence = envelope.sequence_number;
        match self.replicate(envelope).await {
            Ok(offset) => offset,
            Err(err) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    sequence,
                    error = %err,
                    "Envelope not applied"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use futures_util::future::join_all;

    use crate::event_sourcing::{
        serialize_event, to_new_event, Aggregate, CommandContext, CommandHandler, DomainEvent,
        Emission, EventLog, HandlerChain, InMemoryEventLog, NewEvent, PersistedEvent, TagStream,
    };
    use crate::error::EventLogError;
    use crate::metrics::Metrics;
    use crate::replication::coordinator::tests::{
        envelope, regions, settings, ForeignMigrationPolicy, Register, RegisterCommand, RegisterEvent,
        RegisterPolicy,
    };
    use crate::replication::{DatacenterClassifier, ReplicationRole};

    fn registry(log: Arc<InMemoryEventLog>, local: &str) -> AggregateRegistry<Register> {
        AggregateRegistry::new(
            settings(log, local),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
    }

    // ------------------------------------------------------------------------
    // A ledger whose entries are priced asynchronously.
    // ------------------------------------------------------------------------

    #[derive(Clone, Debug, Default)]
    struct Ledger {
        entries: Vec<String>,
    }

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    enum LedgerEvent {
        Opened { regions: Vec<String> },
        Priced { entry: String },
    }

    impl DomainEvent for LedgerEvent {
        fn event_type(&self) -> &'static str {
            match self {
                LedgerEvent::Opened { .. } => "Opened",
                LedgerEvent::Priced { .. } => "Priced",
            }
        }
    }

    enum LedgerCommand {
        Open,
        Price { entry: String, delay: Duration },
    }

    #[derive(Debug, thiserror::Error)]
    #[error("ledger error")]
    struct LedgerError;

    impl Aggregate for Ledger {
        const AGGREGATE_TYPE: &'static str = "ledger";
        type Event = LedgerEvent;
        type Command = LedgerCommand;
        type Reply = u64;
        type Error = LedgerError;

        fn initial() -> Self {
            Ledger::default()
        }

        fn apply(mut self, event: &LedgerEvent) -> Self {
            if let LedgerEvent::Priced { entry } = event {
                self.entries.push(entry.clone());
            }
            self
        }
    }

    struct OpenHandler;

    impl CommandHandler<Ledger> for OpenHandler {
        fn can_handle(&self, command: &LedgerCommand) -> bool {
            matches!(command, LedgerCommand::Open)
        }

        fn events_to_emit(&self, _ctx: &CommandContext<'_, Ledger>) -> Emission<Ledger> {
            Emission::one(LedgerEvent::Opened { regions: vec!["eu".into()] })
        }

        fn reply(&self, ctx: &CommandContext<'_, Ledger>, _events: &[LedgerEvent]) -> u64 {
            ctx.last_sequence
        }
    }

    struct PriceHandler;

    impl CommandHandler<Ledger> for PriceHandler {
        fn can_handle(&self, command: &LedgerCommand) -> bool {
            matches!(command, LedgerCommand::Price { .. })
        }

        fn is_already_applied(&self, ctx: &CommandContext<'_, Ledger>) -> bool {
            match ctx.command {
                LedgerCommand::Price { entry, .. } => ctx.state.entries.contains(entry),
                _ => false,
            }
        }

        fn events_to_emit(&self, ctx: &CommandContext<'_, Ledger>) -> Emission<Ledger> {
            let LedgerCommand::Price { entry, delay } = ctx.command else {
                return Emission::none();
            };
            let entry = entry.clone();
            let delay = *delay;
            Emission::Later(Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(vec![LedgerEvent::Priced { entry }])
            }))
        }

        fn reply(&self, ctx: &CommandContext<'_, Ledger>, _events: &[LedgerEvent]) -> u64 {
            ctx.last_sequence
        }
    }

    struct LedgerPolicy;

    impl DatacenterClassifier<LedgerEvent> for LedgerPolicy {
        fn classify(&self, event: &LedgerEvent) -> crate::replication::RegionSet {
            match event {
                LedgerEvent::Opened { regions } => crate::replication::RegionSet::new(regions.clone()),
                LedgerEvent::Priced { .. } => crate::replication::RegionSet::empty(),
            }
        }
    }

    impl crate::replication::ReplicationPolicy<Ledger> for LedgerPolicy {
        fn validate_first_event(&self, event: &LedgerEvent, local_region: &str) -> Result<(), String> {
            crate::replication::require_local_owner(&self.classify(event), local_region)
        }

        fn migration_event(&self, _state: &Ledger, local_region: &str) -> LedgerEvent {
            LedgerEvent::Opened { regions: vec![local_region.to_string()] }
        }
    }

    fn ledger_registry(log: Arc<dyn EventLog>, idle_timeout: Duration) -> AggregateRegistry<Ledger> {
        AggregateRegistry::new(
            CoordinatorSettings {
                log,
                handlers: Arc::new(HandlerChain::new().with(OpenHandler).with(PriceHandler)),
                policy: Arc::new(LedgerPolicy),
                local_region: "eu".to_string(),
                max_pending_envelopes: 16,
                metrics: Arc::new(Metrics::new().unwrap()),
            },
            idle_timeout,
            Duration::from_secs(5),
        )
    }

    fn price(entry: &str, millis: u64) -> LedgerCommand {
        LedgerCommand::Price {
            entry: entry.to_string(),
            delay: Duration::from_millis(millis),
        }
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_write_to_new_aggregate_becomes_primary() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = registry(log.clone(), "eu");

        registry
            .execute("eu:1", RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();

        let snapshot = registry.snapshot("eu:1").await.unwrap();
        assert_eq!(snapshot.role, ReplicationRole::Primary);
        assert_eq!(snapshot.last_sequence, 1);

        let history = log.replay("eu:1").await.unwrap();
        assert_eq!(history.len(), 1);
        let first: RegisterEvent = crate::event_sourcing::deserialize_event(&history[0].payload).unwrap();
        assert_eq!(RegisterPolicy.classify(&first).owner(), Some("eu"));
    }

    #[tokio::test]
    async fn test_created_aggregates_get_identities_minted_here() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = registry(log.clone(), "eu");

        let (first, _) = registry
            .create(RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();
        let (second, _) = registry
            .create(RegisterCommand::Create { regions: regions(&["eu", "us"]) })
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(first.region(), Some("eu"));
        assert_eq!(log.len(first.as_str()).await, 1);
        assert!(registry.snapshot(first.as_str()).await.unwrap().role.is_primary());
    }

    #[tokio::test]
    async fn test_envelope_to_new_aggregate_becomes_replica() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = registry(log.clone(), "eu");
        let created = RegisterEvent::Created { regions: regions(&["us", "eu"]) };

        let ack = registry.replicate(envelope("us:9", 1, &created)).await.unwrap();
        assert_eq!(ack, 1001);

        let snapshot = registry.snapshot("us:9").await.unwrap();
        assert!(snapshot.role.is_replica());
        assert_eq!(log.len("us:9").await, 1);
    }

    #[tokio::test]
    async fn test_async_commands_compute_in_parallel_and_persist_serially() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = ledger_registry(log.clone(), Duration::from_secs(60));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();

        let started = Instant::now();
        let (a, b) = tokio::join!(
            registry.execute("eu:l1", price("a", 500)),
            registry.execute("eu:l1", price("b", 500)),
        );
        let elapsed = started.elapsed();

        let mut sequences = vec![a.unwrap(), b.unwrap()];
        sequences.sort();
        assert_eq!(sequences, vec![2, 3]);
        assert!(elapsed < Duration::from_millis(900), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_concurrent_async_commands_get_unique_contiguous_sequences() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = ledger_registry(log.clone(), Duration::from_secs(60));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();

        let commands = (0..20u64).map(|i| {
            let registry = registry.clone();
            async move {
                registry
                    .execute("eu:l1", price(&format!("e{i}"), (20 - i) * 5))
                    .await
            }
        });
        let replies = join_all(commands).await;

        let mut sequences: Vec<u64> = replies.into_iter().map(|r| r.unwrap()).collect();
        sequences.sort();
        assert_eq!(sequences, (2..=21).collect::<Vec<u64>>());

        let history = log.replay("eu:l1").await.unwrap();
        let stored: Vec<u64> = history.iter().map(|e| e.sequence_number).collect();
        assert_eq!(stored, (1..=21).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_redelivered_async_command_is_applied_once() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = ledger_registry(log.clone(), Duration::from_secs(60));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();

        let (a, b) = tokio::join!(
            registry.execute("eu:l1", price("same", 50)),
            registry.execute("eu:l1", price("same", 80)),
        );
        assert_eq!(a.unwrap(), 2);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(log.len("eu:l1").await, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_envelopes_are_applied_in_sequence() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = registry(log.clone(), "eu");
        let created = RegisterEvent::Created { regions: regions(&["us", "eu"]) };
        let written = RegisterEvent::Written { value: "v".into() };

        let later = {
            let registry = registry.clone();
            let envelope = envelope("us:9", 2, &written);
            tokio::spawn(async move { registry.replicate(envelope).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.len("us:9").await, 0);

        assert_eq!(registry.replicate(envelope("us:9", 1, &created)).await.unwrap(), 1001);
        assert_eq!(later.await.unwrap().unwrap(), 1002);

        let stored: Vec<u64> = log
            .replay("us:9")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(stored, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_legacy_aggregate_migrates_before_queued_commands() {
        let log = Arc::new(InMemoryEventLog::new());
        let legacy = RegisterEvent::Written { value: "old".into() };
        log.append("order-1", 0, vec![to_new_event(&legacy, vec![]).unwrap()])
            .await
            .unwrap();
        let registry = registry(log.clone(), "eu");

        let values = registry
            .execute("order-1", RegisterCommand::Write("new".into()))
            .await
            .unwrap();
        assert_eq!(values, vec!["old".to_string(), "new".to_string()]);

        let history = log.replay("order-1").await.unwrap();
        let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["Written", "Migrated", "Written"]);
        assert_eq!(history[1].tags, vec!["register@us".to_string()]);
        assert_eq!(registry.snapshot("order-1").await.unwrap().role, ReplicationRole::Primary);
    }

    #[tokio::test]
    async fn test_failed_migration_refuses_queued_commands() {
        let log = Arc::new(InMemoryEventLog::new());
        let legacy = RegisterEvent::Written { value: "old".into() };
        log.append("order-1", 0, vec![to_new_event(&legacy, vec![]).unwrap()])
            .await
            .unwrap();
        let registry = AggregateRegistry::new(
            CoordinatorSettings {
                policy: Arc::new(ForeignMigrationPolicy),
                ..settings(log.clone(), "eu")
            },
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let refused = registry
            .execute("order-1", RegisterCommand::Write("new".into()))
            .await;
        assert!(matches!(refused, Err(CommandError::Recovery(_))));
        assert_eq!(log.len("order-1").await, 1);
    }

    #[tokio::test]
    async fn test_no_passivation_while_envelopes_wait_for_a_gap() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = AggregateRegistry::new(
            settings(log.clone(), "eu"),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let created = RegisterEvent::Created { regions: regions(&["us", "eu"]) };
        let written = RegisterEvent::Written { value: "v".into() };

        let later = {
            let registry = registry.clone();
            let envelope = envelope("us:9", 2, &written);
            tokio::spawn(async move { registry.replicate(envelope).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.live_instances(), 1);

        assert_eq!(registry.replicate(envelope("us:9", 1, &created)).await.unwrap(), 1001);
        assert_eq!(later.await.unwrap().unwrap(), 1002);
        assert_eq!(log.len("us:9").await, 2);
    }

    #[tokio::test]
    async fn test_idle_instance_passivates_and_recovers_identical_state() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let registry = ledger_registry(log.clone(), Duration::from_millis(100));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();
        registry.execute("eu:l1", price("a", 1)).await.unwrap();
        let before = registry.snapshot("eu:l1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.live_instances(), 0);

        let after = registry.snapshot("eu:l1").await.unwrap();
        assert_eq!(after.state.entries, before.state.entries);
        assert_eq!(after.last_sequence, before.last_sequence);
        assert_eq!(after.role, ReplicationRole::Primary);
    }

    #[tokio::test]
    async fn test_no_passivation_while_async_work_is_outstanding() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = ledger_registry(log.clone(), Duration::from_millis(50));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();

        let sequence = registry.execute("eu:l1", price("slow", 300)).await.unwrap();
        assert_eq!(sequence, 2);
        assert_eq!(log.len("eu:l1").await, 2);
    }

    // ------------------------------------------------------------------------
    // Persistence failure
    // ------------------------------------------------------------------------

    /// Fails every append after the first `healthy` ones.
    struct FlakyLog {
        inner: InMemoryEventLog,
        healthy: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EventLog for FlakyLog {
        async fn append(&self, id: &str, expected: u64, events: Vec<NewEvent>) -> Result<u64, EventLogError> {
            let left = self.healthy.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EventLogError::backend("disk on fire"));
            }
            self.healthy.store(left - 1, Ordering::SeqCst);
            self.inner.append(id, expected, events).await
        }

        async fn replay(&self, id: &str) -> Result<Vec<PersistedEvent>, EventLogError> {
            self.inner.replay(id).await
        }

        async fn last_sequence(&self, id: &str) -> Result<u64, EventLogError> {
            self.inner.last_sequence(id).await
        }

        async fn events_by_tag(&self, tag: &str, after: u64) -> Result<TagStream, EventLogError> {
            self.inner.events_by_tag(tag, after).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_command_and_restarts_instance() {
        let log = Arc::new(FlakyLog {
            inner: InMemoryEventLog::new(),
            healthy: std::sync::atomic::AtomicUsize::new(1),
        });
        let registry = ledger_registry(log.clone(), Duration::from_secs(60));
        registry.execute("eu:l1", LedgerCommand::Open).await.unwrap();

        let failed = registry.execute("eu:l1", price("a", 1)).await;
        assert!(matches!(failed, Err(CommandError::Persistence(_))));

        log.healthy.store(1, Ordering::SeqCst);
        let sequence = registry.execute("eu:l1", price("a", 1)).await.unwrap();
        assert_eq!(sequence, 2);
    }

    #[tokio::test]
    async fn test_router_acks_zero_for_undeliverable_envelopes() {
        let log = Arc::new(InMemoryEventLog::new());
        let registry = registry(log.clone(), "eu");
        registry
            .execute("eu:1", RegisterCommand::Create { regions: regions(&["eu"]) })
            .await
            .unwrap();

        let foreign = RegisterEvent::Written { value: "x".into() };
        let offset = registry.route(envelope("eu:1", 2, &foreign)).await;
        assert_eq!(offset, 0);

        let payload = serialize_event(&foreign).unwrap();
        let garbage = EventEnvelope {
            aggregate_id: "us:2".into(),
            sequence_number: 1,
            timestamp: 5,
            event: payload[..3].to_vec(),
        };
        assert_eq!(registry.route(garbage).await, 0);
    }
}
