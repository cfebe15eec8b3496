// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// This module contains GENERIC, reusable event sourcing infrastructure
// that works with ANY domain aggregate.
//
// Key Principles:
// - No domain-specific code (no Order, Customer, Product, etc.)
// - Generic over aggregate types
// - Reusable across all aggregates
//
// ============================================================================

pub mod aggregate;
pub mod command;
pub mod event;

// Re-export core types for convenience
pub use aggregate::Aggregate;
pub use command::{CommandContext, CommandHandler, Emission, HandlerChain};
pub use event::{
    deserialize_event, serialize_event, to_new_event, DomainEvent, NewEvent, PersistedEvent,
};
