// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Each aggregate has its own subdirectory with:
// - Value objects
// - Events
// - Commands
// - Errors
// - Aggregate (state + fold)
// - Command handlers (the ordered handler chain)
// - Replication policy (classifier, first-event rule, migration event)
//
// ============================================================================

pub mod order;
