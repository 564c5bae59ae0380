//! Common types for the CourtSync environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a peer process taking part in a session.
///
/// Ordering is lexicographic on the underlying string, which is what the
/// coordinator election relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Creates a PeerId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    
    /// Creates a deterministic PeerId from an index (for simulation).
    ///
    /// Index 0 maps to `p1`, so simulated sessions read like `p1..pN`.
    pub fn from_index(index: usize) -> Self {
        Self(format!("p{}", index + 1))
    }
    
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a match session.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
    
    /// Returns the segment used inside store keys (hyphen-free hex).
    pub fn key_segment(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Namespace a key lives in (e.g. `game`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreScope(pub String);

impl StoreScope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }
    
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hint passed with every write describing how long the value matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Superseded quickly (state snapshots, inputs). May be dropped under load.
    Ephemeral,
    /// Must survive until overwritten (coordinator record).
    Persistent,
}

/// Lock requested for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Plain read, may observe a stale value.
    Shared,
    /// Read intended to precede a compare-and-swap.
    Exclusive,
}

/// A value as held by the shared store.
///
/// The payload is opaque bytes; the core serializes its own wire types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    /// The raw value bytes
    pub payload: Vec<u8>,
    
    /// Per-key version assigned by the store, strictly increasing per write
    pub version: u64,
    
    /// Store clock when the value was written (milliseconds)
    pub written_at_ms: u64,
    
    /// Peer that wrote the value, if known
    pub writer: Option<PeerId>,
}

impl StoredValue {
    /// Creates a new stored value.
    pub fn new(payload: Vec<u8>, version: u64, written_at_ms: u64, writer: Option<PeerId>) -> Self {
        Self {
            payload,
            version,
            written_at_ms,
            writer,
        }
    }
    
    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_peer_id_lexicographic_order() {
        let mut ids = vec![PeerId::new("b"), PeerId::new("a"), PeerId::new("c")];
        ids.sort();
        assert_eq!(ids[0], PeerId::new("a"));
        assert_eq!(ids[2], PeerId::new("c"));
    }
    
    #[test]
    fn test_peer_id_from_index() {
        assert_eq!(PeerId::from_index(0).as_str(), "p1");
        assert_eq!(PeerId::from_index(2).as_str(), "p3");
    }
    
    #[test]
    fn test_session_id_from_seed_is_deterministic() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
        assert_eq!(SessionId::from_seed(7).key_segment().len(), 32);
    }
}
