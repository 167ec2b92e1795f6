//! Identity types shared across the concentrator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable opaque peer identity.
///
/// Derived from the subject Common Name of the validated client certificate.
/// Uniqueness is a correctness requirement: the address pool and the access
/// controller key on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Access-control group identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn peer_id_display_and_eq() {
        let a = PeerId::from("client-abc12345");
        let b = PeerId::new("client-abc12345".to_string());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "client-abc12345");
    }

    #[test]
    fn peer_id_usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(PeerId::from("p1"), 1);
        map.insert(PeerId::from("p2"), 2);
        assert_eq!(map.get(&PeerId::from("p1")), Some(&1));
    }

    #[test]
    fn group_id_ordering_is_lexicographic() {
        let mut groups = vec![GroupId::from("ops"), GroupId::from("dev")];
        groups.sort();
        assert_eq!(groups[0].as_str(), "dev");
    }
}
