//! CourtSync Core - Authoritative session sync for two-team court games
//!
//! One peer (the coordinator) runs the full simulation and broadcasts
//! snapshots through a last-write-wins shared store; every other peer
//! predicts its own actor and reconciles toward those snapshots:
//! 1. **Single source of truth**: one typed state tree with change
//!    notification, snapshots and a bounded change log
//! 2. **Phase-driven flow**: shots, inbounds, rebounds, violations and
//!    overtime as a timed phase machine, with watchdogs against stalls
//! 3. **Graceful authority**: deterministic re-election when the
//!    coordinator leaves, promoted with compare-and-swap

pub mod actor;
pub mod config;
pub mod state;
pub mod events;
pub mod phase;
pub mod possession;
pub mod watchdog;
pub mod hints;
pub mod flow;
pub mod wire;
pub mod error;
pub mod authority;
pub mod prediction;
pub mod election;
pub mod peer_runtime;

// Re-export key types for convenience
pub use actor::{Actor, ActorId, ControlMap, InputAction, InputCommand, Roster, Team};
pub use config::{NetworkQuality, SyncConfig};
pub use error::SessionError;
pub use events::{EventBus, EventKind, GameEvent, PossessionReason};
pub use flow::{FixedShotResolver, FrameInputs, GameFlow, ShotResolver};
pub use peer_runtime::{PeerConfig, PeerStats, SessionPeer, TickReport};
pub use phase::{Phase, PhaseMachine};
pub use state::{SessionState, StateContainer, StatePath, StateValue};
