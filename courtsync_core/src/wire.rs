//! Shared-store key layout and payloads.
//!
//! All keys live in the `game` scope and are session-scoped:
//! `game.<sid>.state`, `game.<sid>.coordinator`, `game.<sid>.inputs.<peer>`.

use crate::actor::{ActorId, ControlMap, InputCommand};
use crate::hints::AnimationHint;
use crate::state::SessionState;
use courtsync_env::{PeerId, SessionId, StoreScope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store scope every session key lives in.
pub const SESSION_SCOPE: &str = "game";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Serializes a payload for the store.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|e| WireError::Encode(e.to_string()))
}

/// Deserializes a payload read from the store.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Key builder for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    session: SessionId,
    scope: StoreScope,
    prefix: String,
}

impl SessionKeys {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            scope: StoreScope::new(SESSION_SCOPE),
            prefix: format!("{}.{}", SESSION_SCOPE, session.key_segment()),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn scope(&self) -> &StoreScope {
        &self.scope
    }

    /// Authoritative snapshot key.
    pub fn state(&self) -> String {
        format!("{}.state", self.prefix)
    }

    /// Coordinator record key.
    pub fn coordinator(&self) -> String {
        format!("{}.coordinator", self.prefix)
    }

    /// Input intent key of one peer.
    pub fn inputs(&self, peer: &PeerId) -> String {
        format!("{}.inputs.{}", self.prefix, peer)
    }
}

/// Latest intent of a follower's controlled actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPacket {
    pub peer: PeerId,
    pub actor: ActorId,
    /// Monotonic per-peer sequence; stale packets are ignored
    pub seq: u64,
    /// Follower frame the intent was sampled on
    pub frame: u64,
    pub command: InputCommand,
}

/// What the coordinator broadcasts every `state_update_interval` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritySnapshot {
    /// Coordinator frame the snapshot was taken on
    pub frame: u64,
    pub coordinator: PeerId,
    /// Coordinator epoch that produced it
    pub epoch: u64,
    pub state: SessionState,
    pub control: ControlMap,
    /// Live animation hints, at most `max_per_packet`
    pub hints: Vec<AnimationHint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{InputAction, Roster};
    use crate::config::SyncConfig;

    #[test]
    fn test_key_layout() {
        let session = SessionId::from_seed(7);
        let keys = SessionKeys::new(session);
        let sid = session.key_segment();

        assert_eq!(keys.scope().as_str(), "game");
        assert_eq!(keys.state(), format!("game.{}.state", sid));
        assert_eq!(keys.coordinator(), format!("game.{}.coordinator", sid));
        assert_eq!(keys.inputs(&PeerId::new("p2")), format!("game.{}.inputs.p2", sid));
    }

    #[test]
    fn test_snapshot_survives_the_wire() {
        let config = SyncConfig::default();
        let roster = Roster::two_teams(2, &config.court, config.movement.max_turbo);
        let snapshot = AuthoritySnapshot {
            frame: 42,
            coordinator: PeerId::new("p1"),
            epoch: 1,
            state: SessionState::new(roster, &config),
            control: ControlMap::new(),
            hints: Vec::new(),
        };

        let bytes = encode(&snapshot).unwrap();
        let back: AuthoritySnapshot = decode(&bytes).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let err = decode::<InputPacket>(b"not json").unwrap_err();
        assert!(matches!(err, WireError::Decode(_)));
    }

    #[test]
    fn test_input_packet_fields() {
        let packet = InputPacket {
            peer: PeerId::new("p2"),
            actor: ActorId(3),
            seq: 9,
            frame: 120,
            command: InputCommand::moving(0.5, -0.5).with_action(InputAction::Turbo),
        };
        let back: InputPacket = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(back.command.action, InputAction::Turbo);
        assert_eq!(back.seq, 9);
    }
}
