use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::core::{
    deserialize_event, to_new_event, Aggregate, CommandContext, CommandHandler, Emission,
    HandlerChain,
};
use super::store::EventLog;
use crate::error::{CommandError, EventLogError};

// ============================================================================
// Aggregate Engine
// ============================================================================
//
// Owns one aggregate's folded state and last sequence number. The engine
// itself is not concurrent: its owner (the aggregate actor) calls it from a
// single task, which makes that task the aggregate's only writer.
//
// Flow for a command:
//
//   resolve  -> handler index (first match)
//   decide   -> Rejected | Reply (idempotent / read-only) | Persist | Deferred
//   persist  -> one atomic append, then fold each event
//   reply    -> computed from the emitted events and the new state
//
// A Deferred decision carries the future computing the events. Its result
// comes back through `complete`, which re-checks validation and idempotency
// against whatever the state is by then.
//
// ============================================================================

pub type PendingEvents<A> =
    BoxFuture<'static, Result<Vec<<A as Aggregate>::Event>, <A as Aggregate>::Error>>;

/// Outcome of handing a command to its handler.
pub enum Decision<A: Aggregate> {
    /// Nothing to persist; reply right away.
    Reply(A::Reply),
    /// Events to append as one batch before replying.
    Persist(Vec<A::Event>),
    /// Events computed asynchronously, outside the serialization point.
    Deferred(PendingEvents<A>),
}

pub struct AggregateEngine<A: Aggregate> {
    id: String,
    state: A,
    last_sequence: u64,
    log: Arc<dyn EventLog>,
    handlers: Arc<HandlerChain<A>>,
}

impl<A: Aggregate> AggregateEngine<A> {
    /// Replay the aggregate's history from the log.
    ///
    /// `observer` sees every recovered event with its sequence number, in
    /// order. It cannot touch the state.
    pub async fn recover(
        id: &str,
        log: Arc<dyn EventLog>,
        handlers: Arc<HandlerChain<A>>,
        mut observer: impl FnMut(u64, &A::Event),
    ) -> Result<Self, EventLogError> {
        let history = log.replay(id).await?;

        let mut state = A::initial();
        let mut last_sequence = 0;
        for record in &history {
            let event: A::Event = deserialize_event(&record.payload)?;
            observer(record.sequence_number, &event);
            state = state.apply(&event);
            last_sequence = record.sequence_number;
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %id,
            events = history.len(),
            last_sequence,
            "Recovered aggregate"
        );

        Ok(Self {
            id: id.to_string(),
            state,
            last_sequence,
            log,
            handlers,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn resolve(&self, command: &A::Command) -> Result<usize, CommandError<A::Error>> {
        self.handlers.resolve(command).ok_or(CommandError::Unhandled)
    }

    pub fn is_read_only(&self, handler: usize) -> bool {
        self.handlers.get(handler).map(|h| h.is_read_only()).unwrap_or(false)
    }

    fn handler(&self, index: usize) -> Result<&dyn CommandHandler<A>, CommandError<A::Error>> {
        self.handlers.get(index).ok_or(CommandError::Unhandled)
    }

    fn context<'a>(&'a self, command: &'a A::Command) -> CommandContext<'a, A> {
        CommandContext {
            state: &self.state,
            command,
            last_sequence: self.last_sequence,
        }
    }

    /// Run validation, the idempotency check and event computation.
    pub fn decide(
        &self,
        handler: usize,
        command: &A::Command,
    ) -> Result<Decision<A>, CommandError<A::Error>> {
        let h = self.handler(handler)?;
        let ctx = self.context(command);

        h.validate(&ctx).map_err(CommandError::Rejected)?;
        if h.is_already_applied(&ctx) {
            return Ok(Decision::Reply(h.reply(&ctx, &[])));
        }

        match h.events_to_emit(&ctx) {
            Emission::Now(events) if events.is_empty() => Ok(Decision::Reply(h.reply(&ctx, &[]))),
            Emission::Now(events) => Ok(Decision::Persist(events)),
            Emission::Later(pending) => Ok(Decision::Deferred(pending)),
        }
    }

    /// Accept the result of a deferred computation.
    ///
    /// Other commands may have been persisted since the computation started,
    /// so validation and idempotency are checked again here.
    pub fn complete(
        &self,
        handler: usize,
        command: &A::Command,
        computed: Result<Vec<A::Event>, A::Error>,
    ) -> Result<Decision<A>, CommandError<A::Error>> {
        let events = computed.map_err(CommandError::Rejected)?;
        let h = self.handler(handler)?;
        let ctx = self.context(command);

        h.validate(&ctx).map_err(CommandError::Rejected)?;
        if h.is_already_applied(&ctx) || events.is_empty() {
            return Ok(Decision::Reply(h.reply(&ctx, &[])));
        }
        Ok(Decision::Persist(events))
    }

    /// Reply for `events` once they are folded into the state.
    pub fn reply(
        &self,
        handler: usize,
        command: &A::Command,
        events: &[A::Event],
    ) -> Result<A::Reply, CommandError<A::Error>> {
        let h = self.handler(handler)?;
        Ok(h.reply(&self.context(command), events))
    }

    /// Append `events` as one batch, then fold them.
    ///
    /// On failure nothing is folded; the state stays at the last durable
    /// sequence number.
    pub async fn persist(
        &mut self,
        events: &[A::Event],
        mut tags: impl FnMut(&A::Event) -> Vec<String>,
    ) -> Result<u64, EventLogError> {
        let records = events
            .iter()
            .map(|e| to_new_event(e, tags(e)))
            .collect::<Result<Vec<_>, _>>()?;

        let new_sequence = self.log.append(&self.id, self.last_sequence, records).await?;

        for event in events {
            self.state = self.state.clone().apply(event);
        }
        self.last_sequence = new_sequence;
        Ok(new_sequence)
    }

    /// Append an event that already carries its sequence number (replicated
    /// from another region). `sequence` must directly follow the last one.
    pub async fn append_sequenced(
        &mut self,
        sequence: u64,
        event: &A::Event,
    ) -> Result<u64, EventLogError> {
        if sequence != self.last_sequence + 1 {
            return Err(EventLogError::SequenceConflict {
                aggregate_id: self.id.clone(),
                expected: sequence.saturating_sub(1),
                actual: self.last_sequence,
            });
        }
        self.persist(std::slice::from_ref(event), |_| Vec::new()).await
    }
}
