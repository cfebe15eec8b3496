use std::fmt;

/// Which copy of an aggregate this instance is.
///
/// Derived from the recovered events on every activation; never stored on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    /// Recovery has not finished.
    Undetermined,
    /// No events yet: the first write makes this region the primary, the
    /// first inbound envelope makes it a replica.
    JustCreated,
    /// Events exist but none carries a region set.
    MigratingLegacy,
    Primary,
    /// Follows the owning region. The owner may be unknown when the applied
    /// envelopes did not carry a region-bearing event.
    Replica { primary: Option<String> },
}

impl ReplicationRole {
    pub fn is_primary(&self) -> bool {
        matches!(self, ReplicationRole::Primary)
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, ReplicationRole::Replica { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationRole::Undetermined => "undetermined",
            ReplicationRole::JustCreated => "just_created",
            ReplicationRole::MigratingLegacy => "migrating_legacy",
            ReplicationRole::Primary => "primary",
            ReplicationRole::Replica { .. } => "replica",
        }
    }
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::Replica { primary: Some(region) } => write!(f, "replica of {region}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Role of an aggregate after recovery.
///
/// `first_owner` is the owning region of the first recovered event that
/// carries a region set.
pub fn determine_role(last_sequence: u64, first_owner: Option<&str>, local_region: &str) -> ReplicationRole {
    match (last_sequence, first_owner) {
        (0, _) => ReplicationRole::JustCreated,
        (_, Some(owner)) if owner == local_region => ReplicationRole::Primary,
        (_, Some(owner)) => ReplicationRole::Replica {
            primary: Some(owner.to_string()),
        },
        (_, None) => ReplicationRole::MigratingLegacy,
    }
}
