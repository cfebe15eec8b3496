// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// - Replication links and their supervisor
// - Health monitoring
//
// ============================================================================

mod health_monitor;
mod replication_link;
mod replication_supervisor;

pub use health_monitor::{GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth};
pub use replication_link::ReplicationLink;
pub use replication_supervisor::{GetLinks, LinkInfo, ReplicationSupervisor, Shutdown};
