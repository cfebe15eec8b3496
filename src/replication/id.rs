use std::fmt;

use uuid::Uuid;

const SEPARATOR: char = ':';

/// Identity of a replicated aggregate.
///
/// Minted as `<region>:<uuid v7>`, so two regions can never create the same
/// identity independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateId(String);

impl AggregateId {
    pub fn generate(region: &str) -> Self {
        Self(format!("{region}{SEPARATOR}{}", Uuid::now_v7()))
    }

    /// Region that minted the identity, if it was generated here.
    pub fn region(&self) -> Option<&str> {
        self.0.rsplit_once(SEPARATOR).map(|(region, _)| region)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_embed_region() {
        let id = AggregateId::generate("eu-west");
        assert_eq!(id.region(), Some("eu-west"));
        assert!(id.as_str().starts_with("eu-west:"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = AggregateId::generate("eu");
        let b = AggregateId::generate("eu");
        let c = AggregateId::generate("us");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_legacy_ids_have_no_region() {
        assert_eq!(AggregateId::from("order-42").region(), None);
    }
}
