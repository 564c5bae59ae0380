//! The State Container - single owner of all mutable session state.
//!
//! Every write goes through [`StateContainer::set`] or
//! [`StateContainer::mutate`], which:
//! 1. Apply the change (a failed batch is rolled back as a whole)
//! 2. Append a [`ChangeRecord`] to a capped ring buffer
//! 3. Notify listeners registered at the changed path and at `Any`,
//!    in registration order
//!
//! Listeners return `Result`; a failing listener is logged and reported in
//! the returned [`NotifyReport`] but never stops the remaining listeners.

use crate::actor::{Actor, ActorId, Roster, Team};
use crate::config::SyncConfig;
use crate::phase::PhaseState;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// Number of change records kept for diagnosis.
pub const CHANGE_LOG_CAPACITY: usize = 100;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by typed writes into the state tree.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Type mismatch at {path}: expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Unknown actor: {0}")]
    UnknownActor(ActorId),

    #[error("Invalid extension path: {0}")]
    InvalidExtensionPath(String),

    #[error("Batch mutation failed: {0}")]
    BatchFailed(String),
}

/// Error returned by a state or event listener.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ============================================================================
// SESSION STATE TREE
// ============================================================================

/// Running score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Score {
    pub team_a: u32,
    pub team_b: u32,
}

impl Score {
    pub fn add(&mut self, team: Team, points: u32) {
        match team {
            Team::TeamA => self.team_a += points,
            Team::TeamB => self.team_b += points,
        }
    }

    pub fn of(&self, team: Team) -> u32 {
        match team {
            Team::TeamA => self.team_a,
            Team::TeamB => self.team_b,
        }
    }

    pub fn is_tied(&self) -> bool {
        self.team_a == self.team_b
    }
}

/// The whole mutable state of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Current gameplay phase and its frame timer
    pub phase: PhaseState,

    /// Team in possession
    pub current_team: Team,

    /// Who holds the ball; `None` means the ball is loose
    pub ball_carrier: Option<ActorId>,

    /// Last known ball position (follows the carrier)
    pub ball_position: Vector2<f64>,

    pub shot_clock: f64,
    pub time_remaining: f64,
    pub overtime_count: u32,

    // === Violation gates ===
    pub rebound_active: bool,
    pub inbounding: bool,
    pub frontcourt_established: bool,

    pub score: Score,

    /// Every actor of the session
    pub roster: Roster,

    /// Subsystem sub-trees the core treats as opaque
    /// (`rubberBanding`, `looseBallSafetyNet`, ...)
    pub extensions: Map<String, Value>,
}

impl SessionState {
    /// Fresh tip-off state: `TeamA` ball, full clocks, normal phase.
    pub fn new(roster: Roster, config: &SyncConfig) -> Self {
        let center = Vector2::new(config.court.length / 2.0, config.court.width / 2.0);
        Self {
            phase: PhaseState::default(),
            current_team: Team::TeamA,
            ball_carrier: None,
            ball_position: center,
            shot_clock: config.default_shot_clock,
            time_remaining: config.game_length_secs,
            overtime_count: 0,
            rebound_active: false,
            inbounding: false,
            frontcourt_established: false,
            score: Score::default(),
            roster,
            extensions: Map::new(),
        }
    }

    /// Team of the current carrier, if any.
    pub fn carrier_team(&self) -> Option<Team> {
        self.ball_carrier.and_then(|id| self.roster.team_of(id))
    }

    /// Reads the value at `path`, `None` when nothing lives there.
    pub fn value_at(&self, path: &StatePath) -> Option<StateValue> {
        let value = match path {
            StatePath::Phase => StateValue::Phase(self.phase.clone()),
            StatePath::CurrentTeam => StateValue::Team(self.current_team),
            StatePath::BallCarrier => StateValue::Carrier(self.ball_carrier),
            StatePath::BallPosition => StateValue::Position(self.ball_position),
            StatePath::ShotClock => StateValue::Number(self.shot_clock),
            StatePath::TimeRemaining => StateValue::Number(self.time_remaining),
            StatePath::OvertimeCount => StateValue::Count(self.overtime_count),
            StatePath::ReboundActive => StateValue::Flag(self.rebound_active),
            StatePath::Inbounding => StateValue::Flag(self.inbounding),
            StatePath::FrontcourtEstablished => StateValue::Flag(self.frontcourt_established),
            StatePath::Score => StateValue::Score(self.score),
            StatePath::Actor(id) => StateValue::Actor(self.roster.get(*id)?.clone()),
            StatePath::Extension(dotted) => StateValue::Json(extension_get(&self.extensions, dotted)?.clone()),
        };
        Some(value)
    }

    /// Writes `value` at `path`, checking the value kind.
    fn write_at(&mut self, path: &StatePath, value: StateValue) -> Result<(), StateError> {
        let mismatch = |expected: &'static str, actual: &StateValue| StateError::TypeMismatch {
            path: path.to_string(),
            expected,
            actual: actual.kind(),
        };

        match (path, value) {
            (StatePath::Phase, StateValue::Phase(p)) => self.phase = p,
            (StatePath::CurrentTeam, StateValue::Team(t)) => self.current_team = t,
            (StatePath::BallCarrier, StateValue::Carrier(c)) => {
                if let Some(id) = c {
                    if !self.roster.contains(id) {
                        return Err(StateError::UnknownActor(id));
                    }
                }
                self.ball_carrier = c;
            }
            (StatePath::BallPosition, StateValue::Position(p)) => self.ball_position = p,
            (StatePath::ShotClock, StateValue::Number(n)) => self.shot_clock = n,
            (StatePath::TimeRemaining, StateValue::Number(n)) => self.time_remaining = n,
            (StatePath::OvertimeCount, StateValue::Count(n)) => self.overtime_count = n,
            (StatePath::ReboundActive, StateValue::Flag(b)) => self.rebound_active = b,
            (StatePath::Inbounding, StateValue::Flag(b)) => self.inbounding = b,
            (StatePath::FrontcourtEstablished, StateValue::Flag(b)) => self.frontcourt_established = b,
            (StatePath::Score, StateValue::Score(s)) => self.score = s,
            (StatePath::Actor(id), StateValue::Actor(actor)) => {
                if actor.id != *id {
                    return Err(StateError::TypeMismatch {
                        path: path.to_string(),
                        expected: "actor with matching id",
                        actual: "actor with different id",
                    });
                }
                self.roster.insert(actor);
            }
            (StatePath::Extension(dotted), StateValue::Json(v)) => {
                extension_set(&mut self.extensions, dotted, v)?;
            }
            (p, other) => return Err(mismatch(p.expected_kind(), &other)),
        }
        Ok(())
    }

    /// Paths whose values differ between `self` and `other`.
    ///
    /// Actors and extension sub-trees are reported individually.
    pub fn diff_paths(&self, other: &SessionState) -> Vec<StatePath> {
        let mut paths = Vec::new();
        if self.phase != other.phase {
            paths.push(StatePath::Phase);
        }
        if self.current_team != other.current_team {
            paths.push(StatePath::CurrentTeam);
        }
        if self.ball_carrier != other.ball_carrier {
            paths.push(StatePath::BallCarrier);
        }
        if self.ball_position != other.ball_position {
            paths.push(StatePath::BallPosition);
        }
        if self.shot_clock != other.shot_clock {
            paths.push(StatePath::ShotClock);
        }
        if self.time_remaining != other.time_remaining {
            paths.push(StatePath::TimeRemaining);
        }
        if self.overtime_count != other.overtime_count {
            paths.push(StatePath::OvertimeCount);
        }
        if self.rebound_active != other.rebound_active {
            paths.push(StatePath::ReboundActive);
        }
        if self.inbounding != other.inbounding {
            paths.push(StatePath::Inbounding);
        }
        if self.frontcourt_established != other.frontcourt_established {
            paths.push(StatePath::FrontcourtEstablished);
        }
        if self.score != other.score {
            paths.push(StatePath::Score);
        }

        let ids: BTreeSet<ActorId> = self.roster.ids().chain(other.roster.ids()).collect();
        for id in ids {
            if self.roster.get(id) != other.roster.get(id) {
                paths.push(StatePath::Actor(id));
            }
        }

        let keys: BTreeSet<&String> = self.extensions.keys().chain(other.extensions.keys()).collect();
        for key in keys {
            if self.extensions.get(key) != other.extensions.get(key) {
                paths.push(StatePath::Extension(key.clone()));
            }
        }
        paths
    }
}

fn extension_get<'a>(root: &'a Map<String, Value>, dotted: &str) -> Option<&'a Value> {
    let mut segments = dotted.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted path inside the extension map, creating intermediate maps.
fn extension_set(root: &mut Map<String, Value>, dotted: &str, value: Value) -> Result<(), StateError> {
    let segments: Vec<&str> = dotted.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StateError::InvalidExtensionPath(dotted.to_string()));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StateError::InvalidExtensionPath(dotted.to_string()))?;

    let mut current = root;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = slot
            .as_object_mut()
            .ok_or_else(|| StateError::InvalidExtensionPath(dotted.to_string()))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

// ============================================================================
// TYPED PATHS AND VALUES
// ============================================================================

/// Addressable location in the state tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatePath {
    Phase,
    CurrentTeam,
    BallCarrier,
    BallPosition,
    ShotClock,
    TimeRemaining,
    OvertimeCount,
    ReboundActive,
    Inbounding,
    FrontcourtEstablished,
    Score,
    Actor(ActorId),
    /// Dotted path into an opaque sub-tree, e.g. `rubberBanding.tier`
    Extension(String),
}

impl StatePath {
    pub fn extension(dotted: impl Into<String>) -> Self {
        StatePath::Extension(dotted.into())
    }

    fn expected_kind(&self) -> &'static str {
        match self {
            StatePath::Phase => "phase",
            StatePath::CurrentTeam => "team",
            StatePath::BallCarrier => "carrier",
            StatePath::BallPosition => "position",
            StatePath::ShotClock | StatePath::TimeRemaining => "number",
            StatePath::OvertimeCount => "count",
            StatePath::ReboundActive | StatePath::Inbounding | StatePath::FrontcourtEstablished => "flag",
            StatePath::Score => "score",
            StatePath::Actor(_) => "actor",
            StatePath::Extension(_) => "json",
        }
    }
}

impl std::fmt::Display for StatePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatePath::Phase => write!(f, "phase"),
            StatePath::CurrentTeam => write!(f, "currentTeam"),
            StatePath::BallCarrier => write!(f, "ballCarrier"),
            StatePath::BallPosition => write!(f, "ballPosition"),
            StatePath::ShotClock => write!(f, "shotClock"),
            StatePath::TimeRemaining => write!(f, "timeRemaining"),
            StatePath::OvertimeCount => write!(f, "overtimeCount"),
            StatePath::ReboundActive => write!(f, "reboundActive"),
            StatePath::Inbounding => write!(f, "inbounding"),
            StatePath::FrontcourtEstablished => write!(f, "frontcourtEstablished"),
            StatePath::Score => write!(f, "score"),
            StatePath::Actor(id) => write!(f, "actors.{}", id.0),
            StatePath::Extension(dotted) => write!(f, "{}", dotted),
        }
    }
}

/// Value stored at a [`StatePath`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Phase(PhaseState),
    Team(Team),
    Carrier(Option<ActorId>),
    Position(Vector2<f64>),
    Number(f64),
    Count(u32),
    Flag(bool),
    Score(Score),
    Actor(Actor),
    Json(Value),
}

impl StateValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Phase(_) => "phase",
            StateValue::Team(_) => "team",
            StateValue::Carrier(_) => "carrier",
            StateValue::Position(_) => "position",
            StateValue::Number(_) => "number",
            StateValue::Count(_) => "count",
            StateValue::Flag(_) => "flag",
            StateValue::Score(_) => "score",
            StateValue::Actor(_) => "actor",
            StateValue::Json(_) => "json",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            StateValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_carrier(&self) -> Option<Option<ActorId>> {
        match self {
            StateValue::Carrier(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            StateValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// CHANGE LOG AND NOTIFICATION
// ============================================================================

/// One applied write, kept for diagnosis only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic per-container sequence number
    pub sequence: u64,
    pub path: StatePath,
    pub old_value: Option<StateValue>,
    pub new_value: Option<StateValue>,
    pub reason: String,
    /// Simulation frame the write happened in
    pub frame: u64,
}

/// Listener selection: one exact path or every path (`"*"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    Exact(StatePath),
    Any,
}

impl PathFilter {
    pub fn matches(&self, path: &StatePath) -> bool {
        match self {
            PathFilter::Exact(p) => p == path,
            PathFilter::Any => true,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

type Listener = Box<dyn FnMut(&ChangeRecord) -> Result<(), ListenerError> + Send>;

/// A listener that returned an error during notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub path: StatePath,
    pub error: ListenerError,
}

/// Outcome of a notifying write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyReport {
    /// Change records appended
    pub changes: usize,
    /// Successful listener invocations
    pub delivered: usize,
    pub failures: Vec<ListenerFailure>,
}

impl NotifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: NotifyReport) {
        self.changes += other.changes;
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

/// Deep copy of the state tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot(SessionState);

impl StateSnapshot {
    pub fn state(&self) -> &SessionState {
        &self.0
    }

    /// Canonical byte form, used to compare snapshots exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }
}

// ============================================================================
// STATE CONTAINER
// ============================================================================

/// Owner of the [`SessionState`] tree.
///
/// Subsystems receive the container explicitly; collaborators read through
/// [`StateContainer::state`] / [`StateContainer::get`] and write only via
/// `set` / `mutate`.
pub struct StateContainer {
    state: SessionState,
    listeners: Vec<(ListenerId, PathFilter, Listener)>,
    next_listener: u64,
    change_log: VecDeque<ChangeRecord>,
    sequence: u64,
    frame: u64,
    listener_failures: u64,
}

impl StateContainer {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            listeners: Vec::new(),
            next_listener: 0,
            change_log: VecDeque::with_capacity(CHANGE_LOG_CAPACITY),
            sequence: 0,
            frame: 0,
            listener_failures: 0,
        }
    }

    /// Read-only view of the whole tree.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Sets the frame stamped on subsequent change records.
    pub fn set_frame(&mut self, frame: u64) {
        self.frame = frame;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Value at `path`, `None` when nothing lives there.
    pub fn get(&self, path: &StatePath) -> Option<StateValue> {
        self.state.value_at(path)
    }

    /// Writes one value and notifies listeners at `path` and `Any`.
    ///
    /// A rejected write (wrong value kind, unknown actor) leaves the tree
    /// untouched and notifies nobody.
    pub fn set(
        &mut self,
        path: StatePath,
        value: StateValue,
        reason: &str,
    ) -> Result<NotifyReport, StateError> {
        let old_value = self.state.value_at(&path);
        self.state.write_at(&path, value)?;
        let new_value = self.state.value_at(&path);

        debug!("set {} ({})", path, reason);
        Ok(self.record_and_notify(path, old_value, new_value, reason))
    }

    /// Applies `f` to the whole tree as one all-or-nothing batch.
    ///
    /// If `f` returns an error the tree is restored to its pre-call value,
    /// no change records are written, no listener runs, and the error is
    /// returned to the caller.
    pub fn mutate<F, E>(&mut self, f: F, reason: &str) -> Result<NotifyReport, E>
    where
        F: FnOnce(&mut SessionState) -> Result<(), E>,
        E: std::fmt::Display,
    {
        let before = self.state.clone();
        if let Err(e) = f(&mut self.state) {
            self.state = before;
            warn!("mutate '{}' rolled back: {}", reason, e);
            return Err(e);
        }

        let paths = before.diff_paths(&self.state);
        let mut report = NotifyReport::default();
        for path in paths {
            let old_value = before.value_at(&path);
            let new_value = self.state.value_at(&path);
            report.merge(self.record_and_notify(path, old_value, new_value, reason));
        }
        Ok(report)
    }

    /// Registers a listener; `PathFilter::Any` receives every change.
    pub fn subscribe<F>(&mut self, filter: PathFilter, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeRecord) -> Result<(), ListenerError> + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, filter, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Deep copy of the current tree.
    pub fn get_snapshot(&self) -> StateSnapshot {
        StateSnapshot(self.state.clone())
    }

    /// Replaces the tree with `snapshot`, notifying every path that changed.
    ///
    /// Restoring the current snapshot changes nothing and notifies nobody.
    pub fn restore(&mut self, snapshot: StateSnapshot) -> NotifyReport {
        let before = std::mem::replace(&mut self.state, snapshot.0);
        let mut report = NotifyReport::default();
        for path in before.diff_paths(&self.state) {
            let old_value = before.value_at(&path);
            let new_value = self.state.value_at(&path);
            report.merge(self.record_and_notify(path, old_value, new_value, "restore"));
        }
        report
    }

    /// Retained change records, oldest first.
    pub fn change_log(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.change_log.iter()
    }

    /// Total listener failures since creation.
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures
    }

    fn record_and_notify(
        &mut self,
        path: StatePath,
        old_value: Option<StateValue>,
        new_value: Option<StateValue>,
        reason: &str,
    ) -> NotifyReport {
        self.sequence += 1;
        let record = ChangeRecord {
            sequence: self.sequence,
            path,
            old_value,
            new_value,
            reason: reason.to_string(),
            frame: self.frame,
        };

        let mut report = NotifyReport {
            changes: 1,
            ..NotifyReport::default()
        };
        for (id, filter, listener) in self.listeners.iter_mut() {
            if !filter.matches(&record.path) {
                continue;
            }
            match listener(&record) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!("state listener {:?} failed on {}: {}", id, record.path, error);
                    report.failures.push(ListenerFailure {
                        listener: *id,
                        path: record.path.clone(),
                        error,
                    });
                }
            }
        }
        self.listener_failures += report.failures.len() as u64;

        if self.change_log.len() >= CHANGE_LOG_CAPACITY {
            self.change_log.pop_front();
        }
        self.change_log.push_back(record);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CourtGeometry;
    use crate::phase::Phase;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn container() -> StateContainer {
        let config = SyncConfig::default();
        let roster = Roster::two_teams(2, &CourtGeometry::default(), 100.0);
        StateContainer::new(SessionState::new(roster, &config))
    }

    #[test]
    fn test_set_then_get() {
        let mut state = container();
        state.set(StatePath::ShotClock, StateValue::Number(12.5), "test").unwrap();

        assert_eq!(state.get(&StatePath::ShotClock), Some(StateValue::Number(12.5)));
        assert_eq!(state.state().shot_clock, 12.5);
    }

    #[test]
    fn test_set_rejects_wrong_kind_without_side_effects() {
        let mut state = container();
        let before = state.get_snapshot();

        let err = state
            .set(StatePath::ShotClock, StateValue::Flag(true), "bad")
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
        assert_eq!(state.get_snapshot(), before);
        assert_eq!(state.change_log().count(), 0);
    }

    #[test]
    fn test_set_unknown_carrier_rejected() {
        let mut state = container();
        let err = state
            .set(StatePath::BallCarrier, StateValue::Carrier(Some(ActorId(99))), "bad")
            .unwrap_err();
        assert_eq!(err, StateError::UnknownActor(ActorId(99)));
    }

    #[test]
    fn test_missing_paths_read_none() {
        let state = container();
        assert!(state.get(&StatePath::Actor(ActorId(42))).is_none());
        assert!(state.get(&StatePath::extension("rubberBanding.tier")).is_none());
    }

    #[test]
    fn test_extension_set_creates_intermediate_maps() {
        let mut state = container();
        state
            .set(
                StatePath::extension("rubberBanding.tier"),
                StateValue::Json(serde_json::json!(2)),
                "tier change",
            )
            .unwrap();

        assert_eq!(
            state.get(&StatePath::extension("rubberBanding.tier")),
            Some(StateValue::Json(serde_json::json!(2)))
        );
        assert_eq!(
            state.get(&StatePath::extension("rubberBanding")),
            Some(StateValue::Json(serde_json::json!({ "tier": 2 })))
        );

        // A primitive cannot become a map
        let err = state
            .set(
                StatePath::extension("rubberBanding.tier.deep"),
                StateValue::Json(serde_json::json!(1)),
                "bad",
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidExtensionPath(_)));
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let mut state = container();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&calls);
        state.subscribe(PathFilter::Exact(StatePath::ShotClock), move |_| {
            c.lock().unwrap().push("exact");
            Ok(())
        });
        let c = Arc::clone(&calls);
        state.subscribe(PathFilter::Any, move |_| {
            c.lock().unwrap().push("any");
            Ok(())
        });
        let c = Arc::clone(&calls);
        state.subscribe(PathFilter::Exact(StatePath::Inbounding), move |_| {
            c.lock().unwrap().push("other");
            Ok(())
        });

        state.set(StatePath::ShotClock, StateValue::Number(3.0), "tick").unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["exact", "any"]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let mut state = container();
        let seen = Arc::new(Mutex::new(0));

        let bad = state.subscribe(PathFilter::Any, |_| Err(ListenerError::new("boom")));
        let s = Arc::clone(&seen);
        state.subscribe(PathFilter::Any, move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });

        let report = state.set(StatePath::Inbounding, StateValue::Flag(true), "x").unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].listener, bad);
        assert_eq!(state.listener_failures(), 1);
        // The write itself still happened
        assert_eq!(state.state().inbounding, true);
    }

    #[test]
    fn test_unsubscribe() {
        let mut state = container();
        let seen = Arc::new(Mutex::new(0));
        let s = Arc::clone(&seen);
        let id = state.subscribe(PathFilter::Any, move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });

        assert!(state.unsubscribe(id));
        assert!(!state.unsubscribe(id));
        state.set(StatePath::ShotClock, StateValue::Number(1.0), "x").unwrap();
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_mutate_commits_and_notifies_each_changed_path() {
        let mut state = container();
        let paths = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&paths);
        state.subscribe(PathFilter::Any, move |rec| {
            p.lock().unwrap().push(rec.path.clone());
            Ok(())
        });

        let report = state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.current_team = Team::TeamB;
                    s.shot_clock = 10.0;
                    Ok(())
                },
                "batch",
            )
            .unwrap();

        assert_eq!(report.changes, 2);
        assert_eq!(*paths.lock().unwrap(), vec![StatePath::CurrentTeam, StatePath::ShotClock]);
    }

    #[test]
    fn test_mutate_failure_rolls_back_byte_for_byte() {
        let mut state = container();
        let seen = Arc::new(Mutex::new(0));
        let s = Arc::clone(&seen);
        state.subscribe(PathFilter::Any, move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });
        let before = state.get_snapshot().to_bytes().unwrap();

        let result = state.mutate(
            |s| {
                s.current_team = Team::TeamB;
                s.ball_carrier = Some(ActorId(1));
                s.roster.get_mut(ActorId(0)).unwrap().turbo = 0.0;
                Err(StateError::BatchFailed("mid-batch failure".into()))
            },
            "doomed",
        );

        assert!(result.is_err());
        assert_eq!(state.get_snapshot().to_bytes().unwrap(), before);
        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(state.change_log().count(), 0);
    }

    #[test]
    fn test_restore_current_snapshot_is_noop() {
        let mut state = container();
        state.set(StatePath::OvertimeCount, StateValue::Count(1), "ot").unwrap();
        let log_len = state.change_log().count();

        let snapshot = state.get_snapshot();
        let report = state.restore(snapshot.clone());

        assert_eq!(report.changes, 0);
        assert_eq!(state.get_snapshot(), snapshot);
        assert_eq!(state.change_log().count(), log_len);
    }

    #[test]
    fn test_restore_rolls_back_and_reports_paths() {
        let mut state = container();
        let snapshot = state.get_snapshot();
        state.set(StatePath::Inbounding, StateValue::Flag(true), "x").unwrap();

        let report = state.restore(snapshot.clone());

        assert_eq!(report.changes, 1);
        assert_eq!(state.get_snapshot(), snapshot);
    }

    #[test]
    fn test_change_log_is_capped() {
        let mut state = container();
        for i in 0..(CHANGE_LOG_CAPACITY + 25) {
            state.set_frame(i as u64);
            state
                .set(StatePath::ShotClock, StateValue::Number(i as f64), "tick")
                .unwrap();
        }

        let log: Vec<&ChangeRecord> = state.change_log().collect();
        assert_eq!(log.len(), CHANGE_LOG_CAPACITY);
        assert_eq!(log[0].frame, 25);
        assert_eq!(log.last().unwrap().new_value, Some(StateValue::Number((CHANGE_LOG_CAPACITY + 24) as f64)));
        assert_eq!(log.last().unwrap().old_value, Some(StateValue::Number((CHANGE_LOG_CAPACITY + 23) as f64)));
    }

    #[test]
    fn test_phase_path_round_trips() {
        let mut state = container();
        let mut phase = PhaseState::default();
        phase.current = Phase::InboundSetup;
        phase.target_frames = 7;
        state.set(StatePath::Phase, StateValue::Phase(phase.clone()), "phase").unwrap();
        assert_eq!(state.get(&StatePath::Phase), Some(StateValue::Phase(phase)));
    }

    proptest! {
        #[test]
        fn prop_last_set_wins(values in proptest::collection::vec((0u8..3, -100.0f64..100.0, any::<bool>()), 1..40)) {
            let mut state = container();
            let mut last_clock = None;
            let mut last_time = None;
            let mut last_flag = None;

            for (slot, number, flag) in values {
                match slot {
                    0 => {
                        state.set(StatePath::ShotClock, StateValue::Number(number), "p").unwrap();
                        last_clock = Some(number);
                    }
                    1 => {
                        state.set(StatePath::TimeRemaining, StateValue::Number(number), "p").unwrap();
                        last_time = Some(number);
                    }
                    _ => {
                        state.set(StatePath::ReboundActive, StateValue::Flag(flag), "p").unwrap();
                        last_flag = Some(flag);
                    }
                }
                if let Some(v) = last_clock {
                    prop_assert_eq!(state.get(&StatePath::ShotClock), Some(StateValue::Number(v)));
                }
                if let Some(v) = last_time {
                    prop_assert_eq!(state.get(&StatePath::TimeRemaining), Some(StateValue::Number(v)));
                }
                if let Some(v) = last_flag {
                    prop_assert_eq!(state.get(&StatePath::ReboundActive), Some(StateValue::Flag(v)));
                }
            }
        }

        #[test]
        fn prop_snapshot_restore_round_trip(clock in 0.0f64..24.0, team_b in any::<bool>()) {
            let mut state = container();
            state.set(StatePath::ShotClock, StateValue::Number(clock), "p").unwrap();
            let team = if team_b { Team::TeamB } else { Team::TeamA };
            state.set(StatePath::CurrentTeam, StateValue::Team(team), "p").unwrap();

            let bytes = state.get_snapshot().to_bytes().unwrap();
            let snapshot = state.get_snapshot();
            state.restore(snapshot);
            prop_assert_eq!(state.get_snapshot().to_bytes().unwrap(), bytes);
        }
    }
}
