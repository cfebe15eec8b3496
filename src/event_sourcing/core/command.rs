use futures_util::future::BoxFuture;

use super::aggregate::Aggregate;

// ============================================================================
// Command Handler Contract
// ============================================================================
//
// A chain of handlers, tried in declared order; the first handler whose
// `can_handle` accepts the command handles it exclusively. For that handler:
//
//   validate        -> Err  : rejection, nothing emitted
//   already applied -> true : deterministic idempotent reply, nothing emitted
//   otherwise               : emit events (now, or later via a future),
//                             persist them atomically, reply from the
//                             emitted events and the new sequence number
//
// ============================================================================

/// What a handler sees when deciding about a command.
pub struct CommandContext<'a, A: Aggregate> {
    pub state: &'a A,
    pub command: &'a A::Command,
    /// Highest persisted sequence number (0 = no events yet).
    pub last_sequence: u64,
}

/// Events a handler wants to emit.
pub enum Emission<A: Aggregate> {
    /// Computed synchronously; persisted before the next command is handled.
    Now(Vec<A::Event>),
    /// Computed off the aggregate's serialization point. The result is
    /// re-validated against the state current at completion time.
    Later(BoxFuture<'static, Result<Vec<A::Event>, A::Error>>),
}

impl<A: Aggregate> Emission<A> {
    pub fn none() -> Self {
        Emission::Now(Vec::new())
    }

    pub fn one(event: A::Event) -> Self {
        Emission::Now(vec![event])
    }
}

/// One link of a handler chain.
pub trait CommandHandler<A: Aggregate>: Send + Sync + 'static {
    /// Whether this handler claims the command.
    fn can_handle(&self, command: &A::Command) -> bool;

    /// Read-only handlers never emit events; replicas may serve them.
    fn is_read_only(&self) -> bool {
        false
    }

    fn validate(&self, _ctx: &CommandContext<'_, A>) -> Result<(), A::Error> {
        Ok(())
    }

    /// True when the command's effect is already part of the state, e.g. a
    /// redelivered command.
    fn is_already_applied(&self, _ctx: &CommandContext<'_, A>) -> bool {
        false
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, A>) -> Emission<A>;

    /// Reply for the sender. `events` is empty for idempotent replays and
    /// read-only commands; `ctx` reflects the state after persistence.
    fn reply(&self, ctx: &CommandContext<'_, A>, events: &[A::Event]) -> A::Reply;
}

/// Ordered, first-match-wins composition of handlers.
pub struct HandlerChain<A: Aggregate> {
    handlers: Vec<Box<dyn CommandHandler<A>>>,
}

impl<A: Aggregate> Default for HandlerChain<A> {
    fn default() -> Self {
        Self { handlers: Vec::new() }
    }
}

impl<A: Aggregate> HandlerChain<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler after all handlers already registered.
    pub fn with(mut self, handler: impl CommandHandler<A>) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Index of the first handler that claims `command`.
    pub fn resolve(&self, command: &A::Command) -> Option<usize> {
        self.handlers.iter().position(|h| h.can_handle(command))
    }

    pub fn get(&self, index: usize) -> Option<&dyn CommandHandler<A>> {
        self.handlers.get(index).map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
