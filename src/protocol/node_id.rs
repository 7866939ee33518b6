//! 128-bit node identifier.
//!
//! Stored as a UUID; written to the wire as its 16 raw big-endian bytes,
//! the one exception to the little-endian rule of the codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of bytes a `NodeId` occupies on the wire.
pub const NODE_ID_SIZE: usize = 16;

/// Identifier of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// The all-zero id, meaning "any node" in connection requests.
    pub const ANY: NodeId = NodeId(Uuid::nil());

    /// Generate a random node id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build from the 16 big-endian wire bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 big-endian wire bytes.
    pub fn to_bytes(&self) -> [u8; NODE_ID_SIZE] {
        *self.0.as_bytes()
    }

    /// True for the all-zero id.
    #[inline]
    pub fn is_any_node(&self) -> bool {
        self.0.is_nil()
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(trimmed).map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_node() {
        assert!(NodeId::ANY.is_any_node());
        assert!(NodeId::default().is_any_node());
        assert!(!NodeId::new_random().is_any_node());
    }

    #[test]
    fn test_bytes_are_big_endian() {
        let id: NodeId = "01020304-0506-0708-090a-0b0c0d0e0f10".parse().unwrap();
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[15], 0x10);
        assert_eq!(NodeId::from_bytes(bytes), id);
    }

    #[test]
    fn test_display_parses_back() {
        let id = NodeId::new_random();
        let text = id.to_string();
        assert!(text.starts_with('{'));
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
    }
}
