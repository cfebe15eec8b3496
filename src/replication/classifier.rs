use crate::event_sourcing::Aggregate;

// ============================================================================
// Datacenter Classifier
// ============================================================================
//
// Maps an event to the ordered list of regions allowed to observe / own it.
// The first region is the owner at the time the event was produced; the
// others follow and receive the event through replication.
//
// Implementations are pure and injected into the coordinator; there is no
// process-wide lookup.
//
// ============================================================================

/// Ordered list of region names. The first one, if any, owns the event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionSet(Vec<String>);

impl RegionSet {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(regions.into_iter().map(Into::into).collect())
    }

    /// The region set of an event that predates replication.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn owner(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn is_owned_by(&self, region: &str) -> bool {
        self.owner() == Some(region)
    }

    pub fn regions(&self) -> &[String] {
        &self.0
    }

    /// Regions other than `local` that must receive the event.
    pub fn followers<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().map(String::as_str).filter(move |r| *r != local)
    }
}

pub trait DatacenterClassifier<E>: Send + Sync + 'static {
    fn classify(&self, event: &E) -> RegionSet;
}

/// Per-aggregate-type replication hooks.
pub trait ReplicationPolicy<A: Aggregate>: DatacenterClassifier<A::Event> {
    /// Check the first event a new primary is about to persist. It must be
    /// owned by `local_region`.
    fn validate_first_event(&self, event: &A::Event, local_region: &str) -> Result<(), String>;

    /// The event that pins a legacy (pre-replication) aggregate to
    /// `local_region`. Its region set must start with `local_region`.
    fn migration_event(&self, state: &A, local_region: &str) -> A::Event;
}

/// Tag under which events of `aggregate_type` are streamed to `region`.
pub fn replication_tag(aggregate_type: &str, region: &str) -> String {
    format!("{aggregate_type}@{region}")
}

/// Shared check for `validate_first_event` implementations.
pub fn require_local_owner(regions: &RegionSet, local_region: &str) -> Result<(), String> {
    match regions.owner() {
        Some(owner) if owner == local_region => Ok(()),
        Some(owner) => Err(format!(
            "first event is owned by {owner}, expected local region {local_region}"
        )),
        None => Err(format!(
            "first event carries no region set, expected owner {local_region}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_is_first_region() {
        let set = RegionSet::new(["eu", "us", "ap"]);
        assert_eq!(set.owner(), Some("eu"));
        assert!(set.is_owned_by("eu"));
        assert!(!set.is_owned_by("us"));
        assert_eq!(RegionSet::empty().owner(), None);
    }

    #[test]
    fn test_followers_exclude_local_region() {
        let set = RegionSet::new(["eu", "us", "ap"]);
        let followers: Vec<&str> = set.followers("eu").collect();
        assert_eq!(followers, vec!["us", "ap"]);
    }

    #[test]
    fn test_require_local_owner() {
        assert!(require_local_owner(&RegionSet::new(["eu"]), "eu").is_ok());
        assert!(require_local_owner(&RegionSet::new(["us", "eu"]), "eu").is_err());
        assert!(require_local_owner(&RegionSet::empty(), "eu").is_err());
    }

    #[test]
    fn test_replication_tag_format() {
        assert_eq!(replication_tag("order", "us"), "order@us");
    }
}
