use super::aggregate::OrderAggregate;
use super::events::{HomeRegionAssigned, OrderEvent};
use crate::replication::{require_local_owner, DatacenterClassifier, RegionSet, ReplicationPolicy};

/// Orders are owned by the region that created them and replicated to the
/// other regions named at creation.
#[derive(Debug, Clone, Default)]
pub struct OrderReplicationPolicy {
    /// Regions a migrated legacy order is replicated to.
    pub peers: Vec<String>,
}

impl OrderReplicationPolicy {
    pub fn new(peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

impl DatacenterClassifier<OrderEvent> for OrderReplicationPolicy {
    fn classify(&self, event: &OrderEvent) -> RegionSet {
        match event {
            OrderEvent::Created(e) => RegionSet::new(e.regions.iter().cloned()),
            OrderEvent::HomeRegionAssigned(e) => RegionSet::new(e.regions.iter().cloned()),
            _ => RegionSet::empty(),
        }
    }
}

impl ReplicationPolicy<OrderAggregate> for OrderReplicationPolicy {
    fn validate_first_event(&self, event: &OrderEvent, local_region: &str) -> Result<(), String> {
        match event {
            OrderEvent::Created(_) => require_local_owner(&self.classify(event), local_region),
            other => Err(format!("an order must start with OrderCreated, not {other:?}")),
        }
    }

    fn migration_event(&self, state: &OrderAggregate, local_region: &str) -> OrderEvent {
        let mut regions = vec![local_region.to_string()];
        for region in state.regions.iter().chain(&self.peers) {
            if !regions.contains(region) {
                regions.push(region.clone());
            }
        }
        OrderEvent::HomeRegionAssigned(HomeRegionAssigned { regions })
    }
}
