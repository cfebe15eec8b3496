// ============================================================================
// Actors Module
// ============================================================================
//
// Structure:
// - aggregate_actor / registry - one single-writer task per live aggregate,
//                                routed by identity
// - core/                      - health types shared by infrastructure actors
// - infrastructure/            - replication links, supervisor, health monitor
//
// ============================================================================

pub mod aggregate_actor;
pub mod core;
pub mod infrastructure;
pub mod registry;

pub use aggregate_actor::{AggregateSnapshot, CommandResult};
pub use infrastructure::{
    GetLinks, GetSystemHealth, HealthMonitorActor, LinkInfo, ReplicationLink, ReplicationSupervisor,
    Shutdown, SystemHealth, UpdateHealth,
};
pub use registry::AggregateRegistry;
pub use self::core::{ComponentHealth, HealthStatus};
