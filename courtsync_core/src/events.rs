//! Event Bus - decoupled publish/subscribe for gameplay events.
//!
//! Rendering, announcer and stats collaborators register handlers for an
//! [`EventKind`] or for [`EventFilter::Any`]. A failing handler is logged and
//! reported in the [`EmitReport`]; the emitting call and the remaining
//! handlers carry on.

use crate::actor::{ActorId, Team};
use courtsync_env::{PeerId, SessionId};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::warn;

/// Number of recent events retained for inspection.
pub const EVENT_HISTORY_CAPACITY: usize = 64;

/// Why possession moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PossessionReason {
    Score,
    Steal,
    Turnover,
    ShotClockViolation,
    Backcourt,
    Rebound,
    JumpBall,
    Inbound,
    /// Observed in an authoritative snapshot (follower side)
    Replicated,
    /// Forced by a watchdog recovery
    Watchdog,
}

impl PossessionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PossessionReason::Score => "score",
            PossessionReason::Steal => "steal",
            PossessionReason::Turnover => "turnover",
            PossessionReason::ShotClockViolation => "shot_clock_violation",
            PossessionReason::Backcourt => "backcourt",
            PossessionReason::Rebound => "rebound",
            PossessionReason::JumpBall => "jump_ball",
            PossessionReason::Inbound => "inbound",
            PossessionReason::Replicated => "replicated",
            PossessionReason::Watchdog => "watchdog",
        }
    }
}

/// Rule violations the game flow detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    ShotClock,
    Backcourt,
}

/// What caused a loose-ball scramble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScrambleCause {
    MissedShot,
    NullCarrier,
    StaleInbound,
}

/// Every event the core emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    PossessionChange {
        old_team: Team,
        new_team: Team,
        reason: PossessionReason,
        carrier: Option<ActorId>,
    },
    InboundSetup {
        inbounding_team: Team,
        inbounder: Option<ActorId>,
        receiver: Option<ActorId>,
        reason: PossessionReason,
    },
    Violation {
        kind: ViolationKind,
        team: Team,
    },
    Score {
        team: Team,
        points: u32,
        shooter: Option<ActorId>,
    },
    ShotAttempt {
        team: Team,
        shooter: ActorId,
    },
    LooseBallScramble {
        position: Vector2<f64>,
        cause: ScrambleCause,
    },
    PhaseChanged {
        from: String,
        to: String,
    },
    CoordinatorChanged {
        old: Option<PeerId>,
        new: PeerId,
        epoch: u64,
    },
    RubberBandTierChange {
        team: Team,
        tier: u32,
    },
    GameOver {
        team_a: u32,
        team_b: u32,
    },
    SessionAbandoned {
        session: SessionId,
    },
}

/// Discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PossessionChange,
    InboundSetup,
    Violation,
    Score,
    ShotAttempt,
    LooseBallScramble,
    PhaseChanged,
    CoordinatorChanged,
    RubberBandTierChange,
    GameOver,
    SessionAbandoned,
}

impl EventKind {
    /// Wire name, as collaborators know it.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PossessionChange => "possession_change",
            EventKind::InboundSetup => "inbound_setup",
            EventKind::Violation => "violation",
            EventKind::Score => "score",
            EventKind::ShotAttempt => "shot_attempt",
            EventKind::LooseBallScramble => "loose_ball_scramble",
            EventKind::PhaseChanged => "phase_changed",
            EventKind::CoordinatorChanged => "coordinator_changed",
            EventKind::RubberBandTierChange => "rubber_band_tier_change",
            EventKind::GameOver => "game_over",
            EventKind::SessionAbandoned => "session_abandoned",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl GameEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GameEvent::PossessionChange { .. } => EventKind::PossessionChange,
            GameEvent::InboundSetup { .. } => EventKind::InboundSetup,
            GameEvent::Violation { .. } => EventKind::Violation,
            GameEvent::Score { .. } => EventKind::Score,
            GameEvent::ShotAttempt { .. } => EventKind::ShotAttempt,
            GameEvent::LooseBallScramble { .. } => EventKind::LooseBallScramble,
            GameEvent::PhaseChanged { .. } => EventKind::PhaseChanged,
            GameEvent::CoordinatorChanged { .. } => EventKind::CoordinatorChanged,
            GameEvent::RubberBandTierChange { .. } => EventKind::RubberBandTierChange,
            GameEvent::GameOver { .. } => EventKind::GameOver,
            GameEvent::SessionAbandoned { .. } => EventKind::SessionAbandoned,
        }
    }
}

// ============================================================================
// BUS
// ============================================================================

/// Error returned by an event handler.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Handler selection: one event kind or every event (`"*"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Kind(EventKind),
    Any,
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Kind(k) => *k == kind,
            EventFilter::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

type Handler = Box<dyn FnMut(&GameEvent) -> Result<(), HandlerError> + Send>;

/// Outcome of one `emit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failures: Vec<(HandlerId, HandlerError)>,
}

impl EmitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Synchronous publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<(HandlerId, EventFilter, Handler)>,
    next_handler: u64,
    history: VecDeque<GameEvent>,
    counts: HashMap<EventKind, u64>,
    handler_failures: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Handlers run in registration order.
    pub fn on<F>(&mut self, filter: EventFilter, handler: F) -> HandlerId
    where
        F: FnMut(&GameEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, filter, Box::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was already gone.
    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _, _)| *hid != id);
        self.handlers.len() != before
    }

    /// Delivers `event` to every matching handler.
    pub fn emit(&mut self, event: GameEvent) -> EmitReport {
        let kind = event.kind();
        let mut report = EmitReport::default();

        for (id, filter, handler) in self.handlers.iter_mut() {
            if !filter.matches(kind) {
                continue;
            }
            match handler(&event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("event handler {:?} failed on {}: {}", id, kind, e);
                    report.failures.push((*id, e));
                }
            }
        }
        self.handler_failures += report.failures.len() as u64;

        *self.counts.entry(kind).or_insert(0) += 1;
        if self.history.len() >= EVENT_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(event);
        report
    }

    /// Events emitted so far of `kind`.
    pub fn count(&self, kind: EventKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Most recent events, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &GameEvent> {
        self.history.iter()
    }

    /// Events emitted since creation, all kinds.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// The newest `n` retained events, oldest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &GameEvent> {
        self.history.iter().skip(self.history.len().saturating_sub(n))
    }

    pub fn last_of(&self, kind: EventKind) -> Option<&GameEvent> {
        self.history.iter().rev().find(|e| e.kind() == kind)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn violation() -> GameEvent {
        GameEvent::Violation {
            kind: ViolationKind::ShotClock,
            team: Team::TeamA,
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::PossessionChange.as_str(), "possession_change");
        assert_eq!(EventKind::CoordinatorChanged.as_str(), "coordinator_changed");
        assert_eq!(EventKind::RubberBandTierChange.as_str(), "rubber_band_tier_change");
        assert_eq!(violation().kind(), EventKind::Violation);
    }

    #[test]
    fn test_filtered_and_wildcard_handlers() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.on(EventFilter::Kind(EventKind::Score), move |_| {
            s.lock().unwrap().push("score");
            Ok(())
        });
        let s = Arc::clone(&seen);
        bus.on(EventFilter::Any, move |_| {
            s.lock().unwrap().push("any");
            Ok(())
        });

        let report = bus.emit(violation());
        assert_eq!(report.delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["any"]);

        bus.emit(GameEvent::Score {
            team: Team::TeamB,
            points: 2,
            shooter: None,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["any", "score", "any"]);
    }

    #[test]
    fn test_failing_handler_isolated() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        bus.on(EventFilter::Any, |_| Err(HandlerError::new("render crashed")));
        let s = Arc::clone(&seen);
        bus.on(EventFilter::Any, move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });

        let report = bus.emit(violation());

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(bus.handler_failures(), 1);
        assert_eq!(bus.count(EventKind::Violation), 1);
    }

    #[test]
    fn test_off() {
        let mut bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let s = Arc::clone(&seen);
        let id = bus.on(EventFilter::Any, move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });

        assert!(bus.off(id));
        bus.emit(violation());
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_history_capped() {
        let mut bus = EventBus::new();
        for _ in 0..(EVENT_HISTORY_CAPACITY + 5) {
            bus.emit(violation());
        }
        assert_eq!(bus.recent().count(), EVENT_HISTORY_CAPACITY);
        assert_eq!(bus.count(EventKind::Violation), (EVENT_HISTORY_CAPACITY + 5) as u64);
        assert!(bus.last_of(EventKind::Violation).is_some());
        assert!(bus.last_of(EventKind::Score).is_none());
    }
}
