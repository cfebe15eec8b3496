use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::classifier::{replication_tag, require_local_owner, RegionSet, ReplicationPolicy};
use super::role::{determine_role, ReplicationRole};
use super::wire::EventEnvelope;
use crate::error::{CommandError, EnvelopeError, EventLogError, ProtocolViolation};
use crate::event_sourcing::{
    deserialize_event, Aggregate, AggregateEngine, Decision, EventLog, HandlerChain,
};
use crate::metrics::Metrics;

// ============================================================================
// Replication Coordinator
// ============================================================================
//
// Wraps the aggregate engine and decides, from the recovered events, which
// copy of the aggregate this instance is:
//
//   no events                        -> JustCreated
//   first region-bearing event owned
//     by the local region            -> Primary
//     by another region              -> Replica(owner)
//   events, none region-bearing      -> MigratingLegacy
//
// Transitions:
//
//   JustCreated     --first write persisted-->  Primary
//   JustCreated     --envelope applied------->  Replica
//   MigratingLegacy --migration persisted---->  Primary
//
// Only the primary accepts writes. Only replicas (and JustCreated) apply
// inbound envelopes. An envelope arriving at a primary means two regions
// created the same identity: it is refused and logged, the instance stays up.
//
// Envelopes beyond the next expected sequence wait in a bounded gap queue
// until their predecessors arrive.
//
// ============================================================================

/// Where an envelope's acknowledgment goes: the applied offset, or why not.
pub type EnvelopeReply = oneshot::Sender<Result<u64, EnvelopeError>>;

struct PendingEnvelope {
    envelope: EventEnvelope,
    waiters: Vec<EnvelopeReply>,
}

pub struct ReplicationCoordinator<A: Aggregate> {
    engine: AggregateEngine<A>,
    policy: Arc<dyn ReplicationPolicy<A>>,
    local_region: String,
    role: ReplicationRole,
    /// Regions of the latest region-bearing event.
    regions: RegionSet,
    gap_queue: BTreeMap<u64, PendingEnvelope>,
    max_pending: usize,
    metrics: Arc<Metrics>,
}

/// Everything a coordinator needs besides the aggregate identity.
#[derive(Clone)]
pub struct CoordinatorSettings<A: Aggregate> {
    pub log: Arc<dyn EventLog>,
    pub handlers: Arc<HandlerChain<A>>,
    pub policy: Arc<dyn ReplicationPolicy<A>>,
    pub local_region: String,
    pub max_pending_envelopes: usize,
    pub metrics: Arc<Metrics>,
}

impl<A: Aggregate> ReplicationCoordinator<A> {
    /// Replay the aggregate and determine its role.
    pub async fn recover(id: &str, settings: CoordinatorSettings<A>) -> Result<Self, EventLogError> {
        let CoordinatorSettings {
            log,
            handlers,
            policy,
            local_region,
            max_pending_envelopes,
            metrics,
        } = settings;

        let mut first_owner: Option<String> = None;
        let mut regions = RegionSet::empty();
        let engine = AggregateEngine::recover(id, log, handlers, |_, event| {
            let classified = policy.classify(event);
            if classified.is_empty() {
                return;
            }
            if first_owner.is_none() {
                first_owner = classified.owner().map(str::to_string);
            }
            regions = classified;
        })
        .await?;

        let role = determine_role(engine.last_sequence(), first_owner.as_deref(), &local_region);

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %id,
            last_sequence = engine.last_sequence(),
            role = %role,
            "🧭 Replication role determined"
        );

        Ok(Self {
            engine,
            policy,
            local_region,
            role,
            regions,
            gap_queue: BTreeMap::new(),
            max_pending: max_pending_envelopes,
            metrics,
        })
    }

    pub fn role(&self) -> &ReplicationRole {
        &self.role
    }

    pub fn state(&self) -> &A {
        self.engine.state()
    }

    pub fn last_sequence(&self) -> u64 {
        self.engine.last_sequence()
    }

    pub fn id(&self) -> &str {
        self.engine.id()
    }

    pub fn queued_envelopes(&self) -> usize {
        self.gap_queue.len()
    }

    // ========================================================================
    // Legacy migration
    // ========================================================================

    /// Pin a legacy aggregate to the local region. No-op for every other role.
    pub async fn migrate_legacy(&mut self) -> Result<(), CommandError<A::Error>> {
        if self.role != ReplicationRole::MigratingLegacy {
            return Ok(());
        }

        let event = self.policy.migration_event(self.engine.state(), &self.local_region);
        let regions = self.policy.classify(&event);
        require_local_owner(&regions, &self.local_region).map_err(|reason| {
            tracing::error!(
                aggregate_id = %self.engine.id(),
                reason = %reason,
                "❌ Migration event does not belong to the local region"
            );
            CommandError::InvariantViolation(reason)
        })?;

        self.persist_tagged(std::slice::from_ref(&event)).await?;
        self.role = ReplicationRole::Primary;

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %self.engine.id(),
            region = %self.local_region,
            sequence = self.engine.last_sequence(),
            "📌 Legacy aggregate migrated, now primary"
        );
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Resolve the command's handler and check the role allows it.
    pub fn admit(&self, command: &A::Command) -> Result<usize, CommandError<A::Error>> {
        let handler = self.engine.resolve(command)?;
        let read_only = self.engine.is_read_only(handler);

        match &self.role {
            ReplicationRole::Undetermined | ReplicationRole::MigratingLegacy => {
                Err(CommandError::RoleNotYetKnown)
            }
            ReplicationRole::JustCreated if read_only => Err(CommandError::RoleNotYetKnown),
            ReplicationRole::Replica { primary } if !read_only => Err(CommandError::NotPrimary {
                primary: primary.clone(),
            }),
            _ => Ok(handler),
        }
    }

    pub fn decide(
        &self,
        handler: usize,
        command: &A::Command,
    ) -> Result<Decision<A>, CommandError<A::Error>> {
        self.engine.decide(handler, command)
    }

    pub fn complete(
        &self,
        handler: usize,
        command: &A::Command,
        computed: Result<Vec<A::Event>, A::Error>,
    ) -> Result<Decision<A>, CommandError<A::Error>> {
        self.engine.complete(handler, command, computed)
    }

    pub fn reply(
        &self,
        handler: usize,
        command: &A::Command,
        events: &[A::Event],
    ) -> Result<A::Reply, CommandError<A::Error>> {
        self.engine.reply(handler, command, events)
    }

    /// Persist the events of a write command.
    ///
    /// The very first event of an aggregate must be owned by the local
    /// region; once it is durable this instance is the primary.
    pub async fn persist(&mut self, events: &[A::Event]) -> Result<u64, CommandError<A::Error>> {
        // A deferred write admitted while JustCreated may complete after an
        // envelope turned this instance into a replica.
        if let ReplicationRole::Replica { primary } = &self.role {
            return Err(CommandError::NotPrimary {
                primary: primary.clone(),
            });
        }

        if self.engine.last_sequence() == 0 {
            if let Some(first) = events.first() {
                self.policy
                    .validate_first_event(first, &self.local_region)
                    .and_then(|_| require_local_owner(&self.policy.classify(first), &self.local_region))
                    .map_err(|reason| {
                        tracing::error!(
                            aggregate_id = %self.engine.id(),
                            reason = %reason,
                            "❌ First event does not belong to the local region"
                        );
                        CommandError::InvariantViolation(reason)
                    })?;
            }
        }

        let sequence = self.persist_tagged(events).await?;

        if self.role == ReplicationRole::JustCreated {
            self.role = ReplicationRole::Primary;
            tracing::info!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %self.engine.id(),
                region = %self.local_region,
                "👑 Aggregate created here, now primary"
            );
        }
        Ok(sequence)
    }

    /// Events are tagged for the followers of their own region set, or of
    /// the aggregate's current one when they name no regions.
    async fn persist_tagged(&mut self, events: &[A::Event]) -> Result<u64, CommandError<A::Error>> {
        let policy = &self.policy;
        let local = self.local_region.as_str();
        let mut regions = self.regions.clone();
        let sequence = self
            .engine
            .persist(events, |event| {
                let classified = policy.classify(event);
                if !classified.is_empty() {
                    regions = classified;
                }
                regions
                    .followers(local)
                    .map(|region| replication_tag(A::AGGREGATE_TYPE, region))
                    .collect()
            })
            .await
            .map_err(CommandError::Persistence)?;
        self.regions = regions;
        Ok(sequence)
    }

    // ========================================================================
    // Inbound envelopes
    // ========================================================================

    /// Apply, queue or refuse an inbound envelope.
    ///
    /// Breaks when a persistence failure leaves the instance unable to
    /// continue; the caller must stop it.
    pub async fn handle_envelope(
        &mut self,
        envelope: EventEnvelope,
        reply: EnvelopeReply,
    ) -> ControlFlow<()> {
        if envelope.aggregate_id != self.engine.id() {
            let violation = ProtocolViolation::IdentityMismatch {
                expected: self.engine.id().to_string(),
                received: envelope.aggregate_id.clone(),
            };
            tracing::error!(violation = %violation, "🚨 Envelope routed to the wrong aggregate");
            self.count_envelope("violation");
            let _ = reply.send(Err(violation.into()));
            return ControlFlow::Continue(());
        }

        match &self.role {
            ReplicationRole::Primary | ReplicationRole::MigratingLegacy => {
                let violation = ProtocolViolation::EnvelopeForPrimary {
                    aggregate_id: self.engine.id().to_string(),
                };
                tracing::error!(
                    violation = %violation,
                    sequence = envelope.sequence_number,
                    "🚨 Two regions claim this aggregate; envelope not applied"
                );
                self.count_envelope("violation");
                let _ = reply.send(Err(violation.into()));
                return ControlFlow::Continue(());
            }
            ReplicationRole::Undetermined => {
                let _ = reply.send(Err(EnvelopeError::Recovery(
                    "replication role not determined".to_string(),
                )));
                return ControlFlow::Continue(());
            }
            ReplicationRole::JustCreated | ReplicationRole::Replica { .. } => {}
        }

        let last = self.engine.last_sequence();
        let sequence = envelope.sequence_number;

        if sequence <= last {
            tracing::debug!(
                aggregate_id = %self.engine.id(),
                sequence,
                last_sequence = last,
                "Duplicate envelope, acknowledging"
            );
            self.count_envelope("duplicate");
            let _ = reply.send(Ok(envelope.timestamp));
            return ControlFlow::Continue(());
        }

        if sequence > last + 1 {
            self.enqueue(envelope, reply);
            return ControlFlow::Continue(());
        }

        let timestamp = envelope.timestamp;
        match self.apply(&envelope).await {
            Ok(()) => {
                let _ = reply.send(Ok(timestamp));
            }
            Err(err) => {
                let fatal = matches!(err, EnvelopeError::Persistence(_));
                let _ = reply.send(Err(err));
                if fatal {
                    return ControlFlow::Break(());
                }
                return ControlFlow::Continue(());
            }
        }

        self.release_queued().await
    }

    fn enqueue(&mut self, envelope: EventEnvelope, reply: EnvelopeReply) {
        let sequence = envelope.sequence_number;

        if let Some(pending) = self.gap_queue.get_mut(&sequence) {
            pending.waiters.push(reply);
            return;
        }

        if self.gap_queue.len() >= self.max_pending {
            tracing::warn!(
                aggregate_id = %self.engine.id(),
                sequence,
                queued = self.gap_queue.len(),
                "Gap queue full, refusing envelope"
            );
            self.count_envelope("refused");
            let _ = reply.send(Err(EnvelopeError::GapQueueFull(self.gap_queue.len())));
            return;
        }

        tracing::debug!(
            aggregate_id = %self.engine.id(),
            sequence,
            last_sequence = self.engine.last_sequence(),
            "Sequence gap, queueing envelope"
        );
        self.count_envelope("queued");
        self.metrics.pending_envelopes.inc();
        self.gap_queue.insert(
            sequence,
            PendingEnvelope {
                envelope,
                waiters: vec![reply],
            },
        );
    }

    /// Apply queued envelopes that became contiguous.
    async fn release_queued(&mut self) -> ControlFlow<()> {
        loop {
            let next = self.engine.last_sequence() + 1;

            // Entries at or below the last sequence were applied meanwhile.
            while let Some(entry) = self.gap_queue.first_entry() {
                if *entry.key() >= next {
                    break;
                }
                let pending = entry.remove();
                self.metrics.pending_envelopes.dec();
                let timestamp = pending.envelope.timestamp;
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(timestamp));
                }
            }

            let Some(pending) = self.gap_queue.remove(&next) else {
                return ControlFlow::Continue(());
            };
            self.metrics.pending_envelopes.dec();

            tracing::debug!(
                aggregate_id = %self.engine.id(),
                sequence = next,
                "Releasing queued envelope"
            );

            match self.apply(&pending.envelope).await {
                Ok(()) => {
                    let timestamp = pending.envelope.timestamp;
                    for waiter in pending.waiters {
                        let _ = waiter.send(Ok(timestamp));
                    }
                }
                Err(err) => {
                    let fatal = matches!(err, EnvelopeError::Persistence(_));
                    let message = err.to_string();
                    let mut waiters = pending.waiters.into_iter();
                    if let Some(first) = waiters.next() {
                        let _ = first.send(Err(err));
                    }
                    for waiter in waiters {
                        let _ = waiter.send(Err(EnvelopeError::Decode(message.clone())));
                    }
                    return if fatal {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    };
                }
            }
        }
    }

    async fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), EnvelopeError> {
        let event: A::Event = deserialize_event(&envelope.event).map_err(|e| {
            tracing::error!(
                aggregate_id = %envelope.aggregate_id,
                sequence = envelope.sequence_number,
                error = %e,
                "Cannot decode replicated event"
            );
            EnvelopeError::Decode(e.to_string())
        })?;
        let classified = self.policy.classify(&event);
        let owner = classified.owner().map(str::to_string);

        self.engine
            .append_sequenced(envelope.sequence_number, &event)
            .await
            .map_err(EnvelopeError::Persistence)?;
        self.count_envelope("applied");
        if !classified.is_empty() {
            self.regions = classified;
        }

        if self.role == ReplicationRole::JustCreated {
            tracing::info!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %self.engine.id(),
                primary = ?owner,
                "🪞 First envelope applied, now replica"
            );
            self.role = ReplicationRole::Replica { primary: owner };
        } else if let ReplicationRole::Replica { primary } = &mut self.role {
            if owner.is_some() {
                *primary = owner;
            }
        }
        Ok(())
    }

    fn count_envelope(&self, outcome: &str) {
        self.metrics
            .envelopes_total
            .with_label_values(&[A::AGGREGATE_TYPE, outcome])
            .inc();
    }
}

impl<A: Aggregate> Drop for ReplicationCoordinator<A> {
    fn drop(&mut self) {
        // Queued waiters see a closed channel; keep the gauge honest.
        self.metrics.pending_envelopes.sub(self.gap_queue.len() as i64);
    }
}
