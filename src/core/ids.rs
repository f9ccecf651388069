//! Identifier Newtypes
//!
//! Opaque IDs for users and rooms. Both are 16-byte UUID-compatible
//! values and implement `Ord` so they can key `BTreeMap`s with a
//! stable iteration order.

use serde::{Deserialize, Serialize};

/// Unique user identifier.
///
/// Derived from the auth provider's subject claim (see
/// `network::auth`), never issued by this server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct UserId(pub [u8; 16]);

impl UserId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Unique room identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomId(pub [u8; 16]);

impl RoomId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random room ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_uuid_roundtrip() {
        let id = UserId::new([7; 16]);
        let s = id.to_uuid_string();
        let parsed = UserId::from_uuid_str(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_room_id_generate_unique() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        assert!(UserId::from_uuid_str("not-a-uuid").is_none());
    }
}
