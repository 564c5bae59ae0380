//! Tunables for the session core.
//!
//! Every struct implements `Default` with the production values and
//! deserializes with `#[serde(default)]`, so a partial JSON document only
//! needs to name the fields it overrides.

use crate::actor::Team;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Top-level configuration for a peer's session core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Duration of one simulation frame in milliseconds (default: 50 = 20 Hz)
    pub frame_delay_ms: u64,

    /// Shot clock value restored on every possession change (seconds)
    pub default_shot_clock: f64,

    /// Regulation game length (seconds)
    pub game_length_secs: f64,

    /// Length of each overtime period (seconds)
    pub overtime_length_secs: f64,

    /// Consecutive frames with no ball carrier before a forced scramble
    pub null_carrier_frame_limit: u32,

    /// Consecutive frames of a non-progressing inbound before a forced scramble
    pub stale_inbound_frame_limit: u32,

    /// Frames between authoritative snapshot broadcasts
    pub state_update_interval: u32,

    /// Frames between coordinator health checks
    pub health_check_interval: u32,

    /// Upper bound on a single store read before it counts as dropped
    pub read_timeout_ms: u64,

    /// Number of store samples used to classify network quality
    pub quality_window: usize,

    /// Re-tune automatically when measured network quality changes
    pub adaptive_tuning: bool,

    /// Phase durations
    pub phase_timing: PhaseTiming,

    /// Follower reconciliation tunables
    pub reconciliation: ReconciliationConfig,

    /// Animation hint replication
    pub hints: HintConfig,

    /// Actor movement and turbo
    pub movement: MovementConfig,

    /// Court dimensions
    pub court: CourtGeometry,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_delay_ms: 50,
            default_shot_clock: 24.0,
            game_length_secs: 120.0,
            overtime_length_secs: 60.0,
            null_carrier_frame_limit: 40,
            stale_inbound_frame_limit: 60,
            state_update_interval: 3,
            health_check_interval: 20,
            read_timeout_ms: 25,
            quality_window: 40,
            adaptive_tuning: true,
            phase_timing: PhaseTiming::default(),
            reconciliation: ReconciliationConfig::default(),
            hints: HintConfig::default(),
            movement: MovementConfig::default(),
            court: CourtGeometry::default(),
        }
    }
}

impl SyncConfig {
    /// Parses a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns the default config with the preset for `quality` applied.
    pub fn tuned_for(quality: NetworkQuality) -> Self {
        let mut config = Self::default();
        config.apply_quality(quality);
        config
    }

    /// Overwrites the network-sensitive tunables with the preset for `quality`.
    pub fn apply_quality(&mut self, quality: NetworkQuality) {
        let (interval, drift, ttl) = match quality {
            NetworkQuality::Excellent => (2, 6.0, 10),
            NetworkQuality::Good => (3, 8.0, 12),
            NetworkQuality::Fair => (4, 10.0, 16),
            NetworkQuality::Poor => (6, 14.0, 24),
        };
        self.state_update_interval = interval;
        self.reconciliation.drift_snap_threshold = drift;
        self.hints.ttl_frames = ttl;
    }

    /// Simulation seconds covered by one frame.
    pub fn frame_secs(&self) -> f64 {
        self.frame_delay_ms as f64 / 1000.0
    }
}

// ============================================================================
// NETWORK QUALITY
// ============================================================================

/// Coarse classification of the store link as seen by one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    /// Classifies a link from its mean latency and read-loss ratio.
    pub fn classify(mean_latency_ms: f64, loss_rate: f64) -> Self {
        if mean_latency_ms < 50.0 && loss_rate < 0.01 {
            NetworkQuality::Excellent
        } else if mean_latency_ms < 100.0 && loss_rate < 0.03 {
            NetworkQuality::Good
        } else if mean_latency_ms < 200.0 && loss_rate < 0.08 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// SUB-CONFIGS
// ============================================================================

/// How long each timed phase lasts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTiming {
    pub shot_queued_ms: u64,
    pub shot_flight_ms: u64,
    pub shot_result_ms: u64,
    pub rebound_scramble_ms: u64,
    pub inbound_setup_ms: u64,
    pub inbound_walk_ms: u64,
    pub dead_ball_ms: u64,
    pub overtime_intro_ms: u64,
    pub jump_ball_ms: u64,
}

impl Default for PhaseTiming {
    fn default() -> Self {
        Self {
            shot_queued_ms: 200,
            shot_flight_ms: 800,
            shot_result_ms: 600,
            rebound_scramble_ms: 900,
            inbound_setup_ms: 700,
            inbound_walk_ms: 1000,
            dead_ball_ms: 500,
            overtime_intro_ms: 2000,
            jump_ball_ms: 600,
        }
    }
}

/// Follower-side correction tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Strength during open play
    pub normal_play: f64,
    /// Strength during scripted inbound movement
    pub inbound_walk: f64,
    /// Strength for the frames following a drift snap
    pub post_snap_recovery: f64,
    /// Strength during loose-ball scrambles
    pub rebound_scramble: f64,
    /// Strength while the ball is dead
    pub dead_ball: f64,

    /// Positional error above which the follower snaps (court units)
    pub drift_snap_threshold: f64,
    /// Corrections smaller than this are not applied (court units)
    pub visual_guard_small_delta: f64,
    /// Bearing differences below this are not overridden (radians)
    pub visual_guard_bearing_threshold: f64,

    /// Frames spent in post-snap recovery
    pub post_snap_recovery_frames: u32,
    /// Input scale right after a snap; ramps back to 1.0 over the recovery
    pub post_snap_input_floor: f64,

    /// Frames of suppressed predictive drain after a hard correction
    pub catchup_frames: u32,
    /// Predictive resource drain factor in steady state
    pub predictive_drain_factor: f64,
    /// Predictive resource drain factor while catching up
    pub catchup_drain_factor: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            normal_play: 0.3,
            inbound_walk: 1.0,
            post_snap_recovery: 0.5,
            rebound_scramble: 0.15,
            dead_ball: 0.4,
            drift_snap_threshold: 8.0,
            visual_guard_small_delta: 0.05,
            visual_guard_bearing_threshold: 0.2,
            post_snap_recovery_frames: 6,
            post_snap_input_floor: 0.4,
            catchup_frames: 4,
            predictive_drain_factor: 0.5,
            catchup_drain_factor: 0.0,
        }
    }
}

/// Animation hint replication tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintConfig {
    /// Frames a hint stays live without being refreshed
    pub ttl_frames: u32,
    /// Hints carried by one snapshot
    pub max_per_packet: usize,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            ttl_frames: 12,
            max_per_packet: 8,
        }
    }
}

/// Actor movement and the turbo resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Court units per second at full stick
    pub speed: f64,
    /// Speed multiplier while turbo is held
    pub turbo_multiplier: f64,
    /// Turbo spent per frame of use (before drain factor)
    pub turbo_drain_per_frame: f64,
    /// Turbo regained per idle frame
    pub turbo_regen_per_frame: f64,
    /// Turbo capacity
    pub max_turbo: f64,
    /// Distance within which a defender can strip the carrier
    pub steal_reach: f64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            speed: 14.0,
            turbo_multiplier: 1.6,
            turbo_drain_per_frame: 2.0,
            turbo_regen_per_frame: 0.5,
            max_turbo: 100.0,
            steal_reach: 2.5,
        }
    }
}

/// Court dimensions and the spots the rules care about.
///
/// `TeamA` attacks the basket at high `x`; `TeamB` attacks the one at low `x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourtGeometry {
    pub length: f64,
    pub width: f64,
    /// Distance of each basket from its baseline
    pub basket_inset: f64,
}

impl Default for CourtGeometry {
    fn default() -> Self {
        Self {
            length: 94.0,
            width: 50.0,
            basket_inset: 5.25,
        }
    }
}

impl CourtGeometry {
    /// Basket `team` shoots at.
    pub fn attacking_basket(&self, team: Team) -> Vector2<f64> {
        let mid_y = self.width / 2.0;
        match team {
            Team::TeamA => Vector2::new(self.length - self.basket_inset, mid_y),
            Team::TeamB => Vector2::new(self.basket_inset, mid_y),
        }
    }

    /// Basket `team` defends.
    pub fn defended_basket(&self, team: Team) -> Vector2<f64> {
        self.attacking_basket(team.opponent())
    }

    /// Baseline spot `team` inbounds from: behind the basket it defends.
    pub fn inbound_spot(&self, team: Team) -> Vector2<f64> {
        let offset_y = self.width / 2.0 - 3.0;
        match team {
            Team::TeamA => Vector2::new(0.5, offset_y),
            Team::TeamB => Vector2::new(self.length - 0.5, offset_y),
        }
    }

    /// True when `pos` is on the half `team` attacks.
    pub fn in_frontcourt(&self, team: Team, pos: &Vector2<f64>) -> bool {
        let half = self.length / 2.0;
        match team {
            Team::TeamA => pos.x > half,
            Team::TeamB => pos.x < half,
        }
    }

    /// Clamps a position onto the playing surface.
    pub fn clamp(&self, pos: Vector2<f64>) -> Vector2<f64> {
        Vector2::new(pos.x.clamp(0.0, self.length), pos.y.clamp(0.0, self.width))
    }

    /// Unit vector pointing from `team`'s baseline toward its attacking basket.
    pub fn attack_direction(&self, team: Team) -> Vector2<f64> {
        match team {
            Team::TeamA => Vector2::new(1.0, 0.0),
            Team::TeamB => Vector2::new(-1.0, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.frame_delay_ms, 50);
        assert_eq!(config.default_shot_clock, 24.0);
        assert_eq!(config.reconciliation.rebound_scramble, 0.15);
        assert_eq!(config.reconciliation.catchup_drain_factor, 0.0);
        assert!((config.frame_secs() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let json = r#"{ "null_carrier_frame_limit": 10, "hints": { "ttl_frames": 3 } }"#;
        let config = SyncConfig::from_json(json).unwrap();

        assert_eq!(config.null_carrier_frame_limit, 10);
        assert_eq!(config.hints.ttl_frames, 3);
        // Untouched fields keep defaults
        assert_eq!(config.hints.max_per_packet, 8);
        assert_eq!(config.stale_inbound_frame_limit, 60);
    }

    #[test]
    fn test_quality_classification() {
        assert_eq!(NetworkQuality::classify(20.0, 0.0), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::classify(80.0, 0.02), NetworkQuality::Good);
        assert_eq!(NetworkQuality::classify(150.0, 0.05), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::classify(20.0, 0.5), NetworkQuality::Poor);
    }

    #[test]
    fn test_presets_get_more_conservative() {
        let excellent = SyncConfig::tuned_for(NetworkQuality::Excellent);
        let poor = SyncConfig::tuned_for(NetworkQuality::Poor);

        assert!(poor.state_update_interval > excellent.state_update_interval);
        assert!(poor.reconciliation.drift_snap_threshold > excellent.reconciliation.drift_snap_threshold);
        assert!(poor.hints.ttl_frames > excellent.hints.ttl_frames);
    }

    #[test]
    fn test_court_geometry() {
        let court = CourtGeometry::default();

        let a_spot = court.inbound_spot(Team::TeamA);
        assert!(!court.in_frontcourt(Team::TeamA, &a_spot));
        assert!(court.in_frontcourt(Team::TeamA, &court.attacking_basket(Team::TeamA)));
        assert!(court.in_frontcourt(Team::TeamB, &court.attacking_basket(Team::TeamB)));

        let clamped = court.clamp(Vector2::new(-5.0, 80.0));
        assert_eq!(clamped, Vector2::new(0.0, 50.0));
    }
}
