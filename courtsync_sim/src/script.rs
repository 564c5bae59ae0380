//! Seeded bot input and shot outcomes.
//!
//! Bots read whatever session state their peer holds (authoritative on
//! the coordinator, replicated on followers), so stale snapshots lead to
//! stale decisions just as they would for a person.

use courtsync_core::flow::accepts_movement;
use courtsync_core::{Actor, ActorId, InputAction, InputCommand, SessionState, ShotResolver, SyncConfig};
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Carriers shoot from inside this range.
const SHOOTING_RANGE: f64 = 24.0;
const SHOT_CHANCE: f64 = 0.08;
const PASS_CHANCE: f64 = 0.02;
const STEAL_CHANCE: f64 = 0.15;
/// Far from the target, bots hold turbo.
const TURBO_DISTANCE: f64 = 30.0;

/// Drives one actor with noisy, seeded decisions.
pub struct BotScript {
    rng: ChaCha8Rng,
    noise_std: f64,
}

impl BotScript {
    /// `noise_std` perturbs each stick component.
    pub fn new(seed: u64, noise_std: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise_std: noise_std.max(0.0),
        }
    }

    /// Picks this frame's input for `actor`.
    pub fn decide(&mut self, state: &SessionState, actor: ActorId, config: &SyncConfig) -> InputCommand {
        if !accepts_movement(state.phase.current) {
            return InputCommand::idle();
        }
        let Some(me) = state.roster.get(actor) else {
            return InputCommand::idle();
        };

        match state.ball_carrier {
            Some(carrier) if carrier == actor => self.carry(me, state, config),
            Some(_) if me.team == state.current_team => {
                let basket = config.court.attacking_basket(me.team);
                let spot = spacing_spot(&basket, actor, config);
                self.steer(me, &spot)
            }
            Some(carrier) => {
                let Some(target) = state.roster.get(carrier) else {
                    return InputCommand::idle();
                };
                let command = self.steer(me, &target.position);
                if me.distance_to(&target.position) <= config.movement.steal_reach
                    && self.rng.gen::<f64>() < STEAL_CHANCE
                {
                    return command.with_action(InputAction::Steal);
                }
                command
            }
            // Loose ball: everyone goes for it
            None => self.steer(me, &state.ball_position),
        }
    }

    fn carry(&mut self, me: &Actor, state: &SessionState, config: &SyncConfig) -> InputCommand {
        let basket = config.court.attacking_basket(me.team);
        let command = self.steer(me, &basket);

        let in_frontcourt = config.court.in_frontcourt(me.team, &me.position);
        if in_frontcourt && me.distance_to(&basket) <= SHOOTING_RANGE && self.rng.gen::<f64>() < SHOT_CHANCE {
            return command.with_action(InputAction::Shoot);
        }
        let has_teammate = state.roster.iter().any(|a| a.team == me.team && a.id != me.id);
        if has_teammate && self.rng.gen::<f64>() < PASS_CHANCE {
            return command.with_action(InputAction::Pass);
        }
        command
    }

    /// Unit stick toward `target` plus noise, with turbo when far.
    fn steer(&mut self, me: &Actor, target: &Vector2<f64>) -> InputCommand {
        let delta = target - me.position;
        let distance = delta.norm();
        if distance < 0.5 {
            return InputCommand::idle();
        }
        let dir = delta / distance;
        let dx = dir.x + self.jitter();
        let dy = dir.y + self.jitter();

        let command = InputCommand::moving(dx, dy);
        if distance > TURBO_DISTANCE && me.turbo > 0.0 {
            command.with_action(InputAction::Turbo)
        } else {
            command
        }
    }

    fn jitter(&mut self) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        z * self.noise_std
    }
}

/// Spot off the ball, spread across the width by actor id.
fn spacing_spot(basket: &Vector2<f64>, actor: ActorId, config: &SyncConfig) -> Vector2<f64> {
    let lanes = 4.0;
    let lane = (actor.0 as f64 % lanes) + 0.5;
    let y = config.court.width * lane / lanes;
    let toward_center = if basket.x > config.court.length / 2.0 { -15.0 } else { 15.0 };
    Vector2::new(basket.x + toward_center, y)
}

/// Makes shots with a probability that falls off with distance.
pub struct SeededShotResolver {
    rng: ChaCha8Rng,
}

impl SeededShotResolver {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn make_probability(distance: f64) -> f64 {
        (0.65 - 0.012 * distance).clamp(0.2, 0.7)
    }
}

impl ShotResolver for SeededShotResolver {
    fn resolve(&mut self, _shooter: &Actor, distance: f64) -> bool {
        self.rng.gen::<f64>() < Self::make_probability(distance)
    }
}
