//! Actors (player sprites), the roster that owns them, and the
//! actor-to-peer control relation.

use crate::config::{CourtGeometry, MovementConfig};
use courtsync_env::PeerId;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One of the two teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Team {
    TeamA,
    TeamB,
}

impl Team {
    /// The other team.
    pub fn opponent(self) -> Team {
        match self {
            Team::TeamA => Team::TeamB,
            Team::TeamB => Team::TeamA,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Team::TeamA => "team_a",
            Team::TeamB => "team_b",
        }
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Stable identifier of an actor for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub u32);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Discrete action attached to a frame's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InputAction {
    #[default]
    None,
    /// Hold turbo: faster movement, drains the turbo resource
    Turbo,
    /// Pass to the nearest teammate
    Pass,
    /// Try to strip the carrier
    Steal,
    /// Shoot at the attacking basket
    Shoot,
}

impl InputAction {
    /// Fires once when received, as opposed to held intent.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, InputAction::Pass | InputAction::Steal | InputAction::Shoot)
    }
}

/// A single frame of intent for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputCommand {
    /// Stick direction; magnitudes above 1.0 are normalized
    pub direction: Vector2<f64>,
    pub action: InputAction,
}

impl Default for InputCommand {
    fn default() -> Self {
        Self {
            direction: Vector2::zeros(),
            action: InputAction::None,
        }
    }
}

impl InputCommand {
    /// No movement, no action.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Plain movement.
    pub fn moving(dx: f64, dy: f64) -> Self {
        Self {
            direction: Vector2::new(dx, dy),
            action: InputAction::None,
        }
    }

    pub fn with_action(mut self, action: InputAction) -> Self {
        self.action = action;
        self
    }

    /// Direction clamped to unit length.
    pub fn stick(&self) -> Vector2<f64> {
        let norm = self.direction.norm();
        if norm > 1.0 {
            self.direction / norm
        } else {
            self.direction
        }
    }
}

/// A player sprite on the court.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub team: Team,
    /// Court position [x, y]
    pub position: Vector2<f64>,
    /// Facing angle in radians
    pub bearing: f64,
    /// Turbo resource, 0 ..= MovementConfig::max_turbo
    pub turbo: f64,
}

impl Actor {
    pub fn new(id: ActorId, team: Team, position: Vector2<f64>, turbo: f64) -> Self {
        Self {
            id,
            team,
            position,
            bearing: 0.0,
            turbo,
        }
    }

    /// Applies one frame of input.
    ///
    /// `input_scale` dampens the stick (post-snap tapering) and
    /// `drain_factor` scales how much turbo this peer debits.
    ///
    /// Returns the turbo spent.
    pub fn apply_input(
        &mut self,
        cmd: &InputCommand,
        movement: &MovementConfig,
        court: &CourtGeometry,
        frame_secs: f64,
        input_scale: f64,
        drain_factor: f64,
    ) -> f64 {
        let stick = cmd.stick() * input_scale;
        let wants_turbo = cmd.action == InputAction::Turbo && self.turbo > 0.0;

        let mut spent = 0.0;
        let multiplier = if wants_turbo {
            spent = (movement.turbo_drain_per_frame * drain_factor).min(self.turbo);
            self.turbo -= spent;
            movement.turbo_multiplier
        } else {
            self.turbo = (self.turbo + movement.turbo_regen_per_frame).min(movement.max_turbo);
            1.0
        };

        if stick.norm_squared() > 0.0 {
            self.bearing = stick.y.atan2(stick.x);
            let step = stick * movement.speed * multiplier * frame_secs;
            self.position = court.clamp(self.position + step);
        }

        spent
    }

    pub fn distance_to(&self, point: &Vector2<f64>) -> f64 {
        (self.position - point).norm()
    }
}

// ============================================================================
// ROSTER
// ============================================================================

/// All actors of a session, keyed by id.
///
/// The session owns the actors; everything else refers to them by `ActorId`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Roster {
    actors: BTreeMap<ActorId, Actor>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds two teams of `per_team` actors lined up on their own halves.
    pub fn two_teams(per_team: u32, court: &CourtGeometry, max_turbo: f64) -> Self {
        let mut roster = Self::new();
        let spacing = court.width / (per_team as f64 + 1.0);
        for i in 0..per_team {
            let y = spacing * (i as f64 + 1.0);
            roster.insert(Actor::new(
                ActorId(i),
                Team::TeamA,
                Vector2::new(court.length * 0.35, y),
                max_turbo,
            ));
            roster.insert(Actor::new(
                ActorId(per_team + i),
                Team::TeamB,
                Vector2::new(court.length * 0.65, y),
                max_turbo,
            ));
        }
        roster
    }

    pub fn insert(&mut self, actor: Actor) {
        self.actors.insert(actor.id, actor);
    }

    pub fn get(&self, id: ActorId) -> Option<&Actor> {
        self.actors.get(&id)
    }

    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut Actor> {
        self.actors.get_mut(&id)
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.actors.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.actors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn team_of(&self, id: ActorId) -> Option<Team> {
        self.actors.get(&id).map(|a| a.team)
    }

    /// Members of `team` sorted by distance to `point`, ties broken by id.
    pub fn ranked_by_distance(&self, team: Team, point: &Vector2<f64>) -> Vec<ActorId> {
        let mut candidates: Vec<(f64, ActorId)> = self
            .actors
            .values()
            .filter(|a| a.team == team)
            .map(|a| (a.distance_to(point), a.id))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// Nearest member of `team` to `point`, skipping `exclude`.
    pub fn nearest(&self, team: Team, point: &Vector2<f64>, exclude: Option<ActorId>) -> Option<ActorId> {
        self.ranked_by_distance(team, point)
            .into_iter()
            .find(|id| Some(*id) != exclude)
    }

    /// Nearest actor of either team to `point`.
    pub fn nearest_any(&self, point: &Vector2<f64>) -> Option<ActorId> {
        self.actors
            .values()
            .map(|a| (a.distance_to(point), a.id))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, id)| id)
    }
}

// ============================================================================
// CONTROL MAP
// ============================================================================

/// Which peer drives which actor.
///
/// Owned by the session rather than stored on the actor, so a peer leaving
/// only needs `release_peer` and never leaves a dangling back-reference.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlMap {
    controllers: BTreeMap<ActorId, PeerId>,
}

impl ControlMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `actor` to `peer`, replacing any previous controller.
    pub fn assign(&mut self, actor: ActorId, peer: PeerId) {
        self.controllers.insert(actor, peer);
    }

    pub fn controller_of(&self, actor: ActorId) -> Option<&PeerId> {
        self.controllers.get(&actor)
    }

    /// The actor driven by `peer`, if any (lowest id when several).
    pub fn actor_of(&self, peer: &PeerId) -> Option<ActorId> {
        self.controllers
            .iter()
            .find(|(_, p)| *p == peer)
            .map(|(a, _)| *a)
    }

    /// Removes every assignment held by `peer`, returning the freed actors.
    pub fn release_peer(&mut self, peer: &PeerId) -> Vec<ActorId> {
        let freed: Vec<ActorId> = self
            .controllers
            .iter()
            .filter(|(_, p)| *p == peer)
            .map(|(a, _)| *a)
            .collect();
        for actor in &freed {
            self.controllers.remove(actor);
        }
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &PeerId)> {
        self.controllers.iter()
    }

    pub fn is_human_controlled(&self, actor: ActorId) -> bool {
        self.controllers.contains_key(&actor)
    }
}
