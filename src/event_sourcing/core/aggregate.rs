use super::event::DomainEvent;

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly)
// 2. Commands are validated by handlers before emitting events
// 3. Events represent facts that have already happened
// 4. Folding is pure and total: no I/O, no failure
//
// The implementing type itself is the aggregate's state.
//
// ============================================================================

/// Generic Aggregate trait - all event-sourced aggregates implement this
///
/// Associated types:
/// - `Event`: the domain events this aggregate emits and folds
/// - `Command`: the commands handled by its handler chain
/// - `Reply`: what a successfully handled command answers with
/// - `Error`: business rule violations reported by validation
pub trait Aggregate: Clone + Send + Sync + Sized + 'static {
    /// Identifies the aggregate type (e.g. `"order"`); used in replication tags.
    const AGGREGATE_TYPE: &'static str;

    type Event: DomainEvent;
    type Command: Send + 'static;
    type Reply: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// The zero state, before any event.
    fn initial() -> Self;

    /// Fold one event into the state.
    ///
    /// Must accept every event the aggregate ever emitted; unknown or
    /// unexpected events leave the state unchanged.
    fn apply(self, event: &Self::Event) -> Self;

    /// Fold a whole history from the zero state.
    fn fold<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Self::Event>,
    {
        events.into_iter().fold(Self::initial(), |state, event| state.apply(event))
    }
}
