//! Prediction/Reconciliation Layer - the follower's local actor.
//!
//! A follower applies its own input immediately, then blends toward each
//! authoritative snapshot with a phase-dependent strength:
//!
//! | Mode               | Strength | Notes                                   |
//! |--------------------|----------|-----------------------------------------|
//! | NormalPlay         | 0.3      | light correction                        |
//! | InboundWalk        | 1.0      | scripted movement, trust authority      |
//! | PostSnapRecovery   | 0.5      | plus input tapering after a snap        |
//! | ReboundScramble    | 0.15     | chaotic motion, minimize snapping       |
//! | DeadBall           | 0.4      |                                         |
//!
//! Errors above the drift-snap threshold snap immediately and enter
//! post-snap recovery; the catch-up window that follows suppresses
//! predictive turbo drain so the follower never double-spends.

use crate::actor::{Actor, InputCommand};
use crate::authority::{predictive_turbo_drain_factor, PeerRole};
use crate::config::{CourtGeometry, MovementConfig, ReconciliationConfig};
use crate::hints::{AnimationHint, HintInbox};
use crate::phase::Phase;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

/// Reconciliation regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationMode {
    NormalPlay,
    InboundWalk,
    PostSnapRecovery,
    ReboundScramble,
    DeadBall,
}

impl ReconciliationMode {
    /// Mode implied by the authoritative game phase.
    pub fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::InboundSetup | Phase::InboundWalk => ReconciliationMode::InboundWalk,
            Phase::ReboundScramble | Phase::ShotMissed => ReconciliationMode::ReboundScramble,
            Phase::DeadBall
            | Phase::ShotScored
            | Phase::OvertimeIntro
            | Phase::JumpBall
            | Phase::GameOver => ReconciliationMode::DeadBall,
            Phase::Normal | Phase::ShotQueued | Phase::ShotAnimating => ReconciliationMode::NormalPlay,
        }
    }

    pub fn strength(&self, config: &ReconciliationConfig) -> f64 {
        let s = match self {
            ReconciliationMode::NormalPlay => config.normal_play,
            ReconciliationMode::InboundWalk => config.inbound_walk,
            ReconciliationMode::PostSnapRecovery => config.post_snap_recovery,
            ReconciliationMode::ReboundScramble => config.rebound_scramble,
            ReconciliationMode::DeadBall => config.dead_ball,
        };
        s.clamp(0.0, 1.0)
    }
}

/// Correction to add to the predicted position.
pub fn compute_correction(predicted: &Vector2<f64>, authoritative: &Vector2<f64>, strength: f64) -> Vector2<f64> {
    (authoritative - predicted) * strength
}

/// Smallest signed angle from `from` to `to`.
fn angle_delta(from: f64, to: f64) -> f64 {
    let mut d = (to - from) % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d < -PI {
        d += 2.0 * PI;
    }
    d
}

/// Orders snapshots across coordinators.
///
/// Frames count each coordinator's own ticks, so a coordinator that joined
/// late publishes lower frames than its predecessor did. Epochs rise with
/// every promotion, which makes `(epoch, frame)` monotonic for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotStamp {
    pub epoch: u64,
    pub frame: u64,
}

impl SnapshotStamp {
    pub fn new(epoch: u64, frame: u64) -> Self {
        Self { epoch, frame }
    }
}

/// What one `reconcile` call did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Snapshot not newer than the last one applied
    Skipped,
    /// Correction below the visual guard
    Suppressed,
    Blended { correction: Vector2<f64> },
    Snapped { error: f64 },
}

/// Follower-side predictor for the locally controlled actor.
#[derive(Debug, Clone)]
pub struct PredictionClient {
    config: ReconciliationConfig,
    mode: ReconciliationMode,
    post_snap_frames: u32,
    catchup_frames: u32,
    last_snapshot: Option<SnapshotStamp>,
    hints: HintInbox,
    snaps: u64,
    last_error: f64,
}

impl PredictionClient {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self {
            config,
            mode: ReconciliationMode::NormalPlay,
            post_snap_frames: 0,
            catchup_frames: 0,
            last_snapshot: None,
            hints: HintInbox::new(),
            snaps: 0,
            last_error: 0.0,
        }
    }

    pub fn mode(&self) -> ReconciliationMode {
        self.mode
    }

    pub fn catchup_frames(&self) -> u32 {
        self.catchup_frames
    }

    pub fn snaps(&self) -> u64 {
        self.snaps
    }

    /// Positional error seen by the last applied snapshot.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    pub fn set_drift_snap_threshold(&mut self, threshold: f64) {
        self.config.drift_snap_threshold = threshold;
    }

    /// Forgets snapshot history (after a role change).
    pub fn reset(&mut self) {
        self.mode = ReconciliationMode::NormalPlay;
        self.post_snap_frames = 0;
        self.catchup_frames = 0;
        self.last_snapshot = None;
    }

    /// Stick scale: tapered from the floor back to 1.0 over post-snap recovery.
    pub fn input_scale(&self) -> f64 {
        let total = self.config.post_snap_recovery_frames;
        if self.post_snap_frames == 0 || total == 0 {
            return 1.0;
        }
        let elapsed = (total - self.post_snap_frames.min(total)) as f64;
        let floor = self.config.post_snap_input_floor.clamp(0.0, 1.0);
        floor + (1.0 - floor) * (elapsed / total as f64)
    }

    /// Current predictive drain factor for this follower.
    pub fn drain_factor(&self) -> f64 {
        predictive_turbo_drain_factor(PeerRole::Follower, self.catchup_frames, &self.config)
    }

    /// Predicts one frame of local input. Returns the turbo spent.
    pub fn apply_local_input(
        &self,
        actor: &mut Actor,
        cmd: &InputCommand,
        movement: &MovementConfig,
        court: &CourtGeometry,
        frame_secs: f64,
    ) -> f64 {
        actor.apply_input(cmd, movement, court, frame_secs, self.input_scale(), self.drain_factor())
    }

    /// Blends the predicted actor toward an authoritative snapshot.
    ///
    /// Each snapshot is applied at most once, and never after a newer one.
    pub fn reconcile(
        &mut self,
        local: &mut Actor,
        authoritative: &Actor,
        stamp: SnapshotStamp,
        phase: Phase,
    ) -> ReconcileOutcome {
        if self.last_snapshot.is_some_and(|last| stamp <= last) {
            return ReconcileOutcome::Skipped;
        }
        self.last_snapshot = Some(stamp);

        // The resource is debited authoritatively
        local.turbo = authoritative.turbo;

        let error = (authoritative.position - local.position).norm();
        self.last_error = error;

        if error > self.config.drift_snap_threshold {
            local.position = authoritative.position;
            local.bearing = authoritative.bearing;
            self.enter_mode(ReconciliationMode::PostSnapRecovery);
            self.post_snap_frames = self.config.post_snap_recovery_frames;
            self.catchup_frames = self.config.catchup_frames;
            self.snaps += 1;
            info!("drift snap on {} (error {:.2})", local.id, error);
            return ReconcileOutcome::Snapped { error };
        }

        let mode = if self.post_snap_frames > 0 {
            ReconciliationMode::PostSnapRecovery
        } else {
            ReconciliationMode::from_phase(phase)
        };
        self.enter_mode(mode);

        if angle_delta(local.bearing, authoritative.bearing).abs() >= self.config.visual_guard_bearing_threshold {
            local.bearing = authoritative.bearing;
        }

        let correction = compute_correction(&local.position, &authoritative.position, mode.strength(&self.config));
        if correction.norm() < self.config.visual_guard_small_delta {
            return ReconcileOutcome::Suppressed;
        }
        local.position += correction;
        ReconcileOutcome::Blended { correction }
    }

    /// Feeds snapshot hints; returns those that fire now.
    pub fn receive_hints(&mut self, hints: &[AnimationHint]) -> Vec<AnimationHint> {
        self.hints.receive(hints)
    }

    /// Ages recovery windows and hint tracking by one frame.
    pub fn tick(&mut self) {
        self.post_snap_frames = self.post_snap_frames.saturating_sub(1);
        self.catchup_frames = self.catchup_frames.saturating_sub(1);
        self.hints.tick();
    }

    fn enter_mode(&mut self, mode: ReconciliationMode) {
        if mode != self.mode {
            debug!("reconciliation mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorId, InputAction, Team};
    use crate::hints::HintKind;
    use approx::assert_relative_eq;

    fn at(frame: u64) -> SnapshotStamp {
        SnapshotStamp::new(1, frame)
    }

    fn actor_at(x: f64, y: f64) -> Actor {
        Actor::new(ActorId(1), Team::TeamA, Vector2::new(x, y), 100.0)
    }

    #[test]
    fn test_inbound_walk_corrects_full_delta() {
        let config = ReconciliationConfig::default();
        let predicted = Vector2::new(10.0, 10.0);
        let authoritative = Vector2::new(13.0, 6.0);

        let strength = ReconciliationMode::InboundWalk.strength(&config);
        let correction = compute_correction(&predicted, &authoritative, strength);

        assert_relative_eq!(correction.x, 3.0);
        assert_relative_eq!(correction.y, -4.0);
    }

    #[test]
    fn test_rebound_scramble_corrects_fifteen_percent() {
        let config = ReconciliationConfig::default();
        let predicted = Vector2::new(10.0, 10.0);
        let authoritative = Vector2::new(13.0, 6.0);

        let strength = ReconciliationMode::from_phase(Phase::ReboundScramble).strength(&config);
        let correction = compute_correction(&predicted, &authoritative, strength);

        assert_relative_eq!(correction.x, 3.0 * 0.15, epsilon = 1e-12);
        assert_relative_eq!(correction.y, -4.0 * 0.15, epsilon = 1e-12);
    }

    #[test]
    fn test_reconcile_blends_by_phase() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let mut local = actor_at(10.0, 10.0);
        let auth = actor_at(12.0, 10.0);

        let outcome = client.reconcile(&mut local, &auth, at(1), Phase::Normal);

        assert!(matches!(outcome, ReconcileOutcome::Blended { .. }));
        assert_relative_eq!(local.position.x, 10.6, epsilon = 1e-9);
        assert_eq!(client.mode(), ReconciliationMode::NormalPlay);
    }

    #[test]
    fn test_same_snapshot_applied_once() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let mut local = actor_at(10.0, 10.0);
        let auth = actor_at(12.0, 10.0);

        client.reconcile(&mut local, &auth, at(4), Phase::Normal);
        let x = local.position.x;
        assert_eq!(client.reconcile(&mut local, &auth, at(4), Phase::Normal), ReconcileOutcome::Skipped);
        assert_eq!(client.reconcile(&mut local, &auth, at(3), Phase::Normal), ReconcileOutcome::Skipped);
        assert_eq!(local.position.x, x);
    }

    #[test]
    fn test_new_epoch_outranks_higher_frames() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let mut local = actor_at(10.0, 10.0);
        let auth = actor_at(12.0, 10.0);

        client.reconcile(&mut local, &auth, SnapshotStamp::new(1, 400), Phase::Normal);
        let outcome = client.reconcile(&mut local, &auth, SnapshotStamp::new(2, 3), Phase::Normal);

        assert!(matches!(outcome, ReconcileOutcome::Blended { .. }));
        assert_eq!(
            client.reconcile(&mut local, &auth, SnapshotStamp::new(1, 401), Phase::Normal),
            ReconcileOutcome::Skipped
        );
    }

    #[test]
    fn test_visual_guard_suppresses_micro_corrections() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let mut local = actor_at(10.0, 10.0);
        let auth = actor_at(10.1, 10.0);

        let outcome = client.reconcile(&mut local, &auth, at(1), Phase::Normal);

        assert_eq!(outcome, ReconcileOutcome::Suppressed);
        assert_eq!(local.position.x, 10.0);
    }

    #[test]
    fn test_small_bearing_difference_kept() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let mut local = actor_at(10.0, 10.0);
        let mut auth = actor_at(10.0, 10.0);
        auth.bearing = 0.1;

        client.reconcile(&mut local, &auth, at(1), Phase::Normal);
        assert_eq!(local.bearing, 0.0);

        auth.bearing = 1.0;
        client.reconcile(&mut local, &auth, at(2), Phase::Normal);
        assert_eq!(local.bearing, 1.0);
    }

    #[test]
    fn test_drift_snap_enters_recovery_and_catchup() {
        let config = ReconciliationConfig::default();
        let mut client = PredictionClient::new(config.clone());
        let mut local = actor_at(10.0, 10.0);
        let mut auth = actor_at(30.0, 10.0);
        auth.turbo = 40.0;

        let outcome = client.reconcile(&mut local, &auth, at(1), Phase::Normal);

        assert!(matches!(outcome, ReconcileOutcome::Snapped { .. }));
        assert_eq!(local.position, auth.position);
        assert_eq!(local.turbo, 40.0);
        assert_eq!(client.mode(), ReconciliationMode::PostSnapRecovery);
        assert_eq!(client.catchup_frames(), config.catchup_frames);
        assert_eq!(client.drain_factor(), config.catchup_drain_factor);
        assert_relative_eq!(client.input_scale(), config.post_snap_input_floor);

        for _ in 0..config.post_snap_recovery_frames {
            client.tick();
        }
        assert_eq!(client.catchup_frames(), 0);
        assert_eq!(client.drain_factor(), config.predictive_drain_factor);
        assert_relative_eq!(client.input_scale(), 1.0);
    }

    #[test]
    fn test_catchup_suppresses_predicted_drain() {
        let config = ReconciliationConfig::default();
        let mut client = PredictionClient::new(config.clone());
        let movement = MovementConfig::default();
        let court = CourtGeometry::default();
        let mut local = actor_at(10.0, 10.0);
        let auth = actor_at(40.0, 10.0);
        client.reconcile(&mut local, &auth, at(1), Phase::Normal);

        let turbo = local.turbo;
        let cmd = InputCommand::moving(1.0, 0.0).with_action(InputAction::Turbo);
        let spent = client.apply_local_input(&mut local, &cmd, &movement, &court, 0.05);

        assert_eq!(spent, 0.0);
        assert_eq!(local.turbo, turbo);
    }

    #[test]
    fn test_mode_from_phase() {
        assert_eq!(ReconciliationMode::from_phase(Phase::InboundWalk), ReconciliationMode::InboundWalk);
        assert_eq!(ReconciliationMode::from_phase(Phase::DeadBall), ReconciliationMode::DeadBall);
        assert_eq!(ReconciliationMode::from_phase(Phase::ShotAnimating), ReconciliationMode::NormalPlay);
    }

    #[test]
    fn test_hints_fire_once() {
        let mut client = PredictionClient::new(ReconciliationConfig::default());
        let hint = AnimationHint::new(HintKind::Knockback, ActorId(1), 6, 10);

        assert_eq!(client.receive_hints(&[hint.clone()]).len(), 1);
        assert!(client.receive_hints(&[hint]).is_empty());
    }
}
