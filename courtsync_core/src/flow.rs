//! Game flow: the per-frame update that drives the phase machine.
//!
//! Runs on the authoritative peer (and in single-process play). Each frame:
//! 1. Apply held movement intent and edge-triggered actions
//! 2. Run the game and shot clocks
//! 3. Step the current phase (violations, shot sequence, inbound,
//!    rebound resolution, overtime, jump ball)
//! 4. Run the watchdogs
//!
//! Shot outcomes come from a [`ShotResolver`]; everything else is
//! deterministic given the inputs.

use crate::actor::{Actor, ActorId, InputAction, InputCommand, Team};
use crate::authority::{predictive_turbo_drain_factor, PeerRole};
use crate::config::SyncConfig;
use crate::events::{EventBus, GameEvent, PossessionReason, ScrambleCause, ViolationKind};
use crate::hints::{AnimationHint, HintKind};
use crate::phase::{Phase, PhaseMachine};
use crate::possession::PossessionSystem;
use crate::state::{StateContainer, StateError};
use crate::watchdog::{LooseBallScramble, ScrambleSpawner, Watchdog, WatchdogReport};
use nalgebra::Vector2;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Shots from at least this far count three points.
pub const THREE_POINT_DISTANCE: f64 = 22.0;
/// Shots from inside this distance are dunks.
const DUNK_DISTANCE: f64 = 4.0;
/// Missed shots come off the rim this far in front of the basket.
const REBOUND_OFFSET: f64 = 3.0;

// ============================================================================
// COLLABORATOR SEAMS
// ============================================================================

/// Decides whether a shot goes in.
pub trait ShotResolver: Send {
    fn resolve(&mut self, shooter: &Actor, distance: f64) -> bool;
}

/// Every shot has the same outcome.
#[derive(Debug, Clone, Copy)]
pub struct FixedShotResolver {
    pub makes: bool,
}

impl FixedShotResolver {
    pub fn makes() -> Self {
        Self { makes: true }
    }

    pub fn misses() -> Self {
        Self { makes: false }
    }
}

impl ShotResolver for FixedShotResolver {
    fn resolve(&mut self, _shooter: &Actor, _distance: f64) -> bool {
        self.makes
    }
}

/// Input for one frame.
///
/// Movement is held intent (re-applied every frame until replaced);
/// actions fire once when they first arrive.
#[derive(Debug, Clone, Default)]
pub struct FrameInputs {
    pub movement: BTreeMap<ActorId, InputCommand>,
    pub actions: Vec<(ActorId, InputAction)>,
}

impl FrameInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, actor: ActorId, command: InputCommand) {
        self.movement.insert(actor, command);
    }

    pub fn act(&mut self, actor: ActorId, action: InputAction) {
        self.actions.push((actor, action));
    }
}

/// What happened during one `update`.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    /// Cosmetic cues for the hint outbox
    pub hints: Vec<AnimationHint>,
    pub watchdog: WatchdogReport,
    pub game_over: bool,
}

// ============================================================================
// GAME FLOW
// ============================================================================

pub struct GameFlow {
    config: SyncConfig,
    phases: PhaseMachine,
    possession: PossessionSystem,
    watchdog: Watchdog,
    spawner: LooseBallScramble,
    resolver: Box<dyn ShotResolver>,
}

impl GameFlow {
    pub fn new(config: &SyncConfig, resolver: Box<dyn ShotResolver>) -> Self {
        Self {
            config: config.clone(),
            phases: PhaseMachine::new(config.frame_delay_ms),
            possession: PossessionSystem::new(config),
            watchdog: Watchdog::new(config),
            spawner: LooseBallScramble::new(config),
            resolver,
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn possession(&self) -> &PossessionSystem {
        &self.possession
    }

    /// Opens the game with a jump ball at center court.
    pub fn start(&mut self, state: &mut StateContainer, events: &mut EventBus) {
        let center = self.center();
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                s.ball_carrier = None;
                s.ball_position = center;
                Ok(())
            },
            "tip_off",
        );
        if let Err(e) = result {
            warn!("tip-off failed: {}", e);
        }
        let from = state.state().phase.current;
        self.enter(state, Phase::JumpBall, Map::new(), self.config.phase_timing.jump_ball_ms);
        events.emit(GameEvent::PhaseChanged {
            from: from.name().to_string(),
            to: Phase::JumpBall.name().to_string(),
        });
    }

    /// Advances the game by one frame.
    pub fn update(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        inputs: &FrameInputs,
        frame: u64,
    ) -> FrameReport {
        state.set_frame(frame);
        let mut report = FrameReport::default();

        let phase = state.state().phase.current;
        if phase == Phase::GameOver {
            report.game_over = true;
            return report;
        }

        if accepts_movement(phase) {
            self.apply_movement(state, &inputs.movement);
        }
        for (actor, action) in &inputs.actions {
            if state.state().phase.current != Phase::Normal {
                break;
            }
            self.apply_action(state, events, *actor, *action, frame, &mut report);
        }

        self.run_clocks(state);
        self.step_phase(state, events, frame, &mut report);
        report.watchdog = self.watchdog.check(state, events, &mut self.spawner);

        let now = state.state().phase.current;
        if now != phase {
            events.emit(GameEvent::PhaseChanged {
                from: phase.name().to_string(),
                to: now.name().to_string(),
            });
        }
        report.game_over = now == Phase::GameOver;
        report
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    fn apply_movement(&self, state: &mut StateContainer, movement: &BTreeMap<ActorId, InputCommand>) {
        let cfg = &self.config;
        let frame_secs = cfg.frame_secs();
        let drain = predictive_turbo_drain_factor(PeerRole::Coordinator, 0, &cfg.reconciliation);

        let result = state.mutate(
            |s| -> Result<(), StateError> {
                for (id, cmd) in movement {
                    if let Some(actor) = s.roster.get_mut(*id) {
                        actor.apply_input(cmd, &cfg.movement, &cfg.court, frame_secs, 1.0, drain);
                    }
                }
                let carrier_pos = s.ball_carrier.and_then(|id| s.roster.get(id)).map(|a| a.position);
                if let Some(pos) = carrier_pos {
                    s.ball_position = pos;
                    if s.phase.current == Phase::Normal && cfg.court.in_frontcourt(s.current_team, &pos) {
                        s.frontcourt_established = true;
                    }
                }
                Ok(())
            },
            "inputs",
        );
        if let Err(e) = result {
            warn!("input application failed: {}", e);
        }
    }

    fn apply_action(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        actor: ActorId,
        action: InputAction,
        frame: u64,
        report: &mut FrameReport,
    ) {
        let s = state.state();
        let Some(me) = s.roster.get(actor).cloned() else {
            return;
        };
        let carrier = s.ball_carrier;
        let team = s.current_team;

        match action {
            InputAction::Pass if carrier == Some(actor) => {
                let Some(target) = s.roster.nearest(me.team, &me.position, Some(actor)) else {
                    return;
                };
                let result = state.mutate(
                    |s| -> Result<(), StateError> {
                        s.ball_carrier = Some(target);
                        if let Some(pos) = s.roster.get(target).map(|a| a.position) {
                            s.ball_position = pos;
                        }
                        Ok(())
                    },
                    "pass",
                );
                if let Err(e) = result {
                    warn!("pass failed: {}", e);
                }
                debug!("{} passes to {}", actor, target);
            }
            InputAction::Steal if me.team != team => {
                let Some(victim) = carrier.and_then(|id| s.roster.get(id)).cloned() else {
                    return;
                };
                if me.distance_to(&victim.position) > self.config.movement.steal_reach {
                    return;
                }
                let result = state.mutate(
                    |s| -> Result<(), StateError> {
                        s.ball_carrier = Some(actor);
                        s.ball_position = me.position;
                        Ok(())
                    },
                    "steal",
                );
                if let Err(e) = result {
                    warn!("steal failed: {}", e);
                    return;
                }
                self.possession
                    .switch_possession(state, events, PossessionReason::Steal, Some(actor));
                report.hints.push(self.hint(HintKind::Knockback, victim.id, frame));
                info!("{} steals from {}", actor, victim.id);
            }
            InputAction::Shoot if carrier == Some(actor) => {
                let basket = self.config.court.attacking_basket(team);
                let distance = me.distance_to(&basket);
                let result = state.mutate(
                    |s| -> Result<(), StateError> {
                        s.ball_carrier = None;
                        Ok(())
                    },
                    "shot_release",
                );
                if let Err(e) = result {
                    warn!("shot release failed: {}", e);
                    return;
                }

                let mut data = Map::new();
                data.insert("shooter".into(), json!(actor.0));
                data.insert("distance".into(), json!(distance));
                data.insert("team".into(), json!(team));
                self.enter(state, Phase::ShotQueued, data, self.config.phase_timing.shot_queued_ms);
                events.emit(GameEvent::ShotAttempt { team, shooter: actor });
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Clocks and phases
    // ------------------------------------------------------------------------

    fn run_clocks(&self, state: &mut StateContainer) {
        let phase = state.state().phase.current;
        if !phase.game_clock_runs() && !phase.shot_clock_runs() {
            return;
        }
        let dt = self.config.frame_secs();
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                if phase.game_clock_runs() {
                    s.time_remaining = (s.time_remaining - dt).max(0.0);
                }
                if phase.shot_clock_runs() {
                    s.shot_clock = (s.shot_clock - dt).max(0.0);
                }
                Ok(())
            },
            "clock",
        );
        if let Err(e) = result {
            warn!("clock update failed: {}", e);
        }
    }

    fn step_phase(&mut self, state: &mut StateContainer, events: &mut EventBus, frame: u64, report: &mut FrameReport) {
        let phase = state.state().phase.current;
        if phase == Phase::Normal {
            self.check_live_ball(state, events);
            return;
        }

        let fired = self.phases.advance_phase_timer(state);
        match phase {
            Phase::ReboundScramble => self.step_scramble(state, events, fired),
            _ if fired => self.on_phase_timer(state, events, phase, frame, report),
            _ => {}
        }
    }

    /// Period end and violations during live play.
    fn check_live_ball(&mut self, state: &mut StateContainer, events: &mut EventBus) {
        let s = state.state();
        if s.time_remaining <= 0.0 {
            self.end_period(state, events);
            return;
        }
        if s.shot_clock <= 0.0 {
            self.violation(state, events, ViolationKind::ShotClock);
            return;
        }

        let carrier_pos = s.ball_carrier.and_then(|id| s.roster.get(id)).map(|a| a.position);
        let backcourt = s.frontcourt_established
            && !s.rebound_active
            && !s.inbounding
            && carrier_pos.is_some_and(|pos| !self.config.court.in_frontcourt(s.current_team, &pos));
        if backcourt {
            self.violation(state, events, ViolationKind::Backcourt);
        }
    }

    fn violation(&mut self, state: &mut StateContainer, events: &mut EventBus, kind: ViolationKind) {
        let team = state.state().current_team;
        info!("{:?} violation on {}", kind, team);
        events.emit(GameEvent::Violation { kind, team });

        let reason = match kind {
            ViolationKind::ShotClock => PossessionReason::ShotClockViolation,
            ViolationKind::Backcourt => PossessionReason::Backcourt,
        };
        self.possession.switch_possession(state, events, reason, None);
        self.enter(state, Phase::DeadBall, Map::new(), self.config.phase_timing.dead_ball_ms);
    }

    fn on_phase_timer(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        phase: Phase,
        frame: u64,
        report: &mut FrameReport,
    ) {
        let timing = self.config.phase_timing.clone();
        match phase {
            Phase::ShotQueued => {
                let data = state.state().phase.data.clone();
                self.enter(state, Phase::ShotAnimating, data, timing.shot_flight_ms);
            }
            Phase::ShotAnimating => self.resolve_shot(state, events, frame, report),
            Phase::ShotScored => {
                let scorer = state.state().current_team;
                self.possession
                    .setup_inbound(state, events, scorer, PossessionReason::Score);
            }
            Phase::ShotMissed => {
                let team = state.state().current_team;
                let basket = self.config.court.attacking_basket(team);
                let spot = basket - self.config.court.attack_direction(team) * REBOUND_OFFSET;
                self.spawner
                    .create_rebound(state, events, spot.x, spot.y, false, ScrambleCause::MissedShot);
            }
            Phase::InboundSetup => {
                let data = state.state().phase.data.clone();
                self.enter(state, Phase::InboundWalk, data, timing.inbound_walk_ms);
            }
            Phase::InboundWalk => {
                self.possession.complete_inbound(state);
            }
            Phase::DeadBall => {
                self.phases.reset_phase(state);
            }
            Phase::OvertimeIntro => {
                self.enter(state, Phase::JumpBall, Map::new(), timing.jump_ball_ms);
            }
            Phase::JumpBall => self.resolve_jump_ball(state, events),
            Phase::Normal | Phase::ReboundScramble | Phase::GameOver => {}
        }
    }

    fn resolve_shot(&mut self, state: &mut StateContainer, events: &mut EventBus, frame: u64, report: &mut FrameReport) {
        let s = state.state();
        let team = s.current_team;
        let shooter = s.phase.data_u32("shooter").map(ActorId);
        let distance = s.phase.data.get("distance").and_then(Value::as_f64).unwrap_or(0.0);
        let shooter_actor = shooter.and_then(|id| s.roster.get(id)).cloned();
        let basket = self.config.court.attacking_basket(team);
        let timing = self.config.phase_timing.clone();

        let made = match &shooter_actor {
            Some(actor) => self.resolver.resolve(actor, distance),
            None => false,
        };

        if !made {
            debug!("shot by {:?} missed", shooter);
            self.enter(state, Phase::ShotMissed, Map::new(), timing.shot_result_ms);
            return;
        }

        let points = if distance >= THREE_POINT_DISTANCE { 3 } else { 2 };
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                s.score.add(team, points);
                s.ball_position = basket;
                Ok(())
            },
            "score",
        );
        if let Err(e) = result {
            warn!("score update failed: {}", e);
        }
        info!("{} scores {} (shooter {:?})", team, points, shooter);
        events.emit(GameEvent::Score { team, points, shooter });

        if let Some(id) = shooter {
            let kind = if distance < DUNK_DISTANCE { HintKind::Dunk } else { HintKind::Celebrate };
            report.hints.push(self.hint(kind, id, frame).with_meta(json!({ "points": points })));
        }

        let mut data = Map::new();
        data.insert("team".into(), json!(team));
        data.insert("points".into(), json!(points));
        self.enter(state, Phase::ShotScored, data, timing.shot_result_ms);
    }

    /// Whoever reaches the ball first secures it; at timeout the nearest
    /// actor does.
    fn step_scramble(&mut self, state: &mut StateContainer, events: &mut EventBus, timed_out: bool) {
        let s = state.state();
        let ball = s.ball_position;
        let Some(nearest) = s.roster.nearest_any(&ball) else {
            if timed_out {
                self.phases.reset_phase(state);
            }
            return;
        };
        let within_reach = s
            .roster
            .get(nearest)
            .is_some_and(|a| a.distance_to(&ball) <= self.config.movement.steal_reach);

        if within_reach || timed_out {
            self.possession
                .gain_loose_ball(state, events, nearest, PossessionReason::Rebound);
            self.phases.reset_phase(state);
        }
    }

    /// Alternating tip: `TeamA` wins even periods, `TeamB` odd ones.
    fn resolve_jump_ball(&mut self, state: &mut StateContainer, events: &mut EventBus) {
        let s = state.state();
        let winner = if s.overtime_count % 2 == 0 { Team::TeamA } else { Team::TeamB };
        let center = self.center();
        let Some(actor) = s.roster.nearest(winner, &center, None) else {
            self.phases.reset_phase(state);
            return;
        };

        if winner != s.current_team {
            self.possession
                .switch_possession(state, events, PossessionReason::JumpBall, Some(actor));
        } else {
            self.possession
                .gain_loose_ball(state, events, actor, PossessionReason::JumpBall);
        }
        self.phases.reset_phase(state);
    }

    /// Regulation or overtime expired: overtime on a tie, otherwise game over.
    fn end_period(&mut self, state: &mut StateContainer, events: &mut EventBus) {
        let score = state.state().score;
        if !score.is_tied() {
            info!("game over {}-{}", score.team_a, score.team_b);
            self.enter(state, Phase::GameOver, Map::new(), 0);
            events.emit(GameEvent::GameOver {
                team_a: score.team_a,
                team_b: score.team_b,
            });
            return;
        }

        let (overtime, shot_clock, center) = (
            self.config.overtime_length_secs,
            self.config.default_shot_clock,
            self.center(),
        );
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                s.overtime_count += 1;
                s.time_remaining = overtime;
                s.shot_clock = shot_clock;
                s.ball_carrier = None;
                s.ball_position = center;
                s.inbounding = false;
                s.rebound_active = false;
                s.frontcourt_established = false;
                Ok(())
            },
            "overtime",
        );
        if let Err(e) = result {
            warn!("overtime setup failed: {}", e);
        }
        info!("tied at {}, overtime #{}", score.team_a, state.state().overtime_count);
        self.enter(
            state,
            Phase::OvertimeIntro,
            Map::new(),
            self.config.phase_timing.overtime_intro_ms,
        );
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn enter(&self, state: &mut StateContainer, phase: Phase, data: Map<String, Value>, duration_ms: u64) {
        self.phases.set_phase(state, phase, data, duration_ms);
    }

    fn hint(&self, kind: HintKind, target: ActorId, frame: u64) -> AnimationHint {
        AnimationHint::new(kind, target, self.config.hints.ttl_frames, frame)
    }

    fn center(&self) -> Vector2<f64> {
        Vector2::new(self.config.court.length / 2.0, self.config.court.width / 2.0)
    }
}

/// Phases in which players move freely.
pub fn accepts_movement(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Normal | Phase::ShotQueued | Phase::ShotAnimating | Phase::ReboundScramble
    )
}
