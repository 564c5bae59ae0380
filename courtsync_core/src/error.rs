//! Errors surfaced by the networked session layers.

use crate::wire::WireError;
use courtsync_env::{EnvError, PeerId, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] EnvError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Session {0} abandoned: no candidate coordinator")]
    Abandoned(SessionId),

    #[error("Peer {0} is not in the session")]
    NotInSession(PeerId),

    #[error("Coordinator record changed concurrently")]
    Contended,
}

impl SessionError {
    /// True for faults that mean "no new information this frame".
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Store(e) => e.is_transient(),
            SessionError::Contended => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SessionError::from(EnvError::Timeout(25)).is_transient());
        assert!(SessionError::Contended.is_transient());
        assert!(!SessionError::Abandoned(SessionId::from_seed(1)).is_transient());
        assert!(!SessionError::Wire(WireError::Decode("x".into())).is_transient());
    }
}
