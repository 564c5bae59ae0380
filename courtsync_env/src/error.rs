//! Error types for the CourtSync environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Store write/read failed (connection dropped, buffer full, etc.)
    #[error("Store error: {0}")]
    StoreError(String),
    
    /// The local peer cannot reach the store (simulated isolation)
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),
    
    /// Value serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
    
    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
    
    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
    
    /// Subscription stream closed by the store
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl EnvError {
    /// Creates a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }
    
    /// Creates an unreachable error.
    pub fn unreachable(peer: impl std::fmt::Display) -> Self {
        Self::PeerUnreachable(peer.to_string())
    }
    
    /// Creates a serialization error.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::SerializationError(msg.to_string())
    }
    
    /// Returns true for faults that should be read as "no new information"
    /// rather than surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreError(_) | Self::PeerUnreachable(_) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_transient_classification() {
        assert!(EnvError::store("dropped").is_transient());
        assert!(EnvError::Timeout(50).is_transient());
        assert!(EnvError::unreachable("p2").is_transient());
        assert!(!EnvError::serialization("bad json").is_transient());
        assert!(!EnvError::SubscriptionClosed("game.x.state".into()).is_transient());
    }
    
    #[test]
    fn test_error_display() {
        let err = EnvError::Timeout(250);
        assert_eq!(err.to_string(), "Timeout after 250ms");
    }
}
