//! Identifier types used across the agent.

use crate::define_id;

// =============================================================================
// Agent-minted IDs
// =============================================================================

define_id!(
    /// Globally unique id of one application instance on this node.
    InstanceId,
    "inst"
);
define_id!(
    /// Identity of this agent on the message bus.
    NodeId,
    "dea"
);
define_id!(
    /// Opaque handle to an isolated execution domain.
    DomainId,
    "dom"
);

// =============================================================================
// Control-plane IDs
// =============================================================================

/// Application ("droplet") id assigned by the control plane.
///
/// The control plane may send it as a JSON string or number; both forms are
/// accepted and normalized to a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DropletId(String);

impl DropletId {
    /// Creates a droplet id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DropletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DropletId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DropletId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl serde::Serialize for DropletId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DropletId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DropletIdVisitor;

        impl serde::de::Visitor<'_> for DropletIdVisitor {
            type Value = DropletId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a droplet id string or integer")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<DropletId, E> {
                if v.is_empty() {
                    return Err(E::custom(crate::IdError::Empty));
                }
                Ok(DropletId(v.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<DropletId, E> {
                Ok(DropletId(v.to_string()))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<DropletId, E> {
                Ok(DropletId(v.to_string()))
            }
        }

        deserializer.deserialize_any(DropletIdVisitor)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_prefix() {
        let id = InstanceId::new();
        assert!(id.to_string().starts_with("inst_"));
    }

    #[test]
    fn test_instance_id_invalid_prefix() {
        let result: Result<InstanceId, _> = "dea_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_instance_id_missing_separator() {
        let result: Result<InstanceId, _> = "inst01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_instance_id_empty() {
        let result: Result<InstanceId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_instance_id_invalid_ulid() {
        let result: Result<NodeId, _> = "dea_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_instance_ids_are_time_ordered() {
        let id1 = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = InstanceId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_droplet_id_accepts_number_and_string() {
        let from_num: DropletId = serde_json::from_str("42").unwrap();
        let from_str: DropletId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"42\"");
    }

    #[test]
    fn test_droplet_id_rejects_empty() {
        assert!(serde_json::from_str::<DropletId>("\"\"").is_err());
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [InstanceId::PREFIX, NodeId::PREFIX, DomainId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = InstanceId::parse(&s);
        }

        #[test]
        fn prop_display_parses_back(_seed in 0u8..16) {
            let id = DomainId::new();
            prop_assert_eq!(DomainId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
