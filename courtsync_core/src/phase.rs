//! Phase State Machine.
//!
//! A single `phase` field describes what the simulation is doing, with a
//! frame-counted timer. Frame counts (not wall-clock time) keep every peer
//! advancing identically, so only state crosses the network.

use crate::state::{NotifyReport, StateContainer, StatePath, StateValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Gameplay phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Normal,
    JumpBall,
    ShotQueued,
    ShotAnimating,
    ShotScored,
    ShotMissed,
    ReboundScramble,
    InboundSetup,
    InboundWalk,
    DeadBall,
    OvertimeIntro,
    GameOver,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Normal => "NORMAL",
            Phase::JumpBall => "JUMP_BALL",
            Phase::ShotQueued => "SHOT_QUEUED",
            Phase::ShotAnimating => "SHOT_ANIMATING",
            Phase::ShotScored => "SHOT_SCORED",
            Phase::ShotMissed => "SHOT_MISSED",
            Phase::ReboundScramble => "REBOUND_SCRAMBLE",
            Phase::InboundSetup => "INBOUND_SETUP",
            Phase::InboundWalk => "INBOUND_WALK",
            Phase::DeadBall => "DEAD_BALL",
            Phase::OvertimeIntro => "OVERTIME_INTRO",
            Phase::GameOver => "GAME_OVER",
        }
    }

    /// Shot in the air or ball up for grabs: watchdogs stand down.
    pub fn is_shot_or_rebound_in_progress(&self) -> bool {
        matches!(
            self,
            Phase::ShotQueued
                | Phase::ShotAnimating
                | Phase::ShotScored
                | Phase::ShotMissed
                | Phase::ReboundScramble
        )
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, Phase::InboundSetup | Phase::InboundWalk)
    }

    /// Scripted stoppages where a loose ball is expected.
    pub fn is_stoppage(&self) -> bool {
        matches!(
            self,
            Phase::JumpBall | Phase::DeadBall | Phase::OvertimeIntro | Phase::GameOver
        )
    }

    /// Phases in which the game clock runs.
    pub fn game_clock_runs(&self) -> bool {
        matches!(
            self,
            Phase::Normal | Phase::ShotQueued | Phase::ShotAnimating | Phase::ReboundScramble
        )
    }

    /// Phases in which the shot clock runs.
    pub fn shot_clock_runs(&self) -> bool {
        *self == Phase::Normal
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The `phase` sub-tree: current phase, its payload and its timer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub current: Phase,
    /// Phase-specific payload (shooter, outcome, ...)
    pub data: Map<String, Value>,
    pub frame_counter: u32,
    /// Zero means untimed
    pub target_frames: u32,
}

impl PhaseState {
    /// Frames needed to cover `duration_ms` at `frame_delay_ms` per frame.
    pub fn target_frames_for(duration_ms: u64, frame_delay_ms: u64) -> u32 {
        let delay = frame_delay_ms.max(1) as f64;
        ((duration_ms as f64 / delay).round() as u32).max(1)
    }

    /// Enters `phase`, replacing the payload and restarting the timer.
    pub fn enter(&mut self, phase: Phase, data: Map<String, Value>, duration_ms: u64, frame_delay_ms: u64) {
        self.current = phase;
        self.data = data;
        self.frame_counter = 0;
        self.target_frames = Self::target_frames_for(duration_ms, frame_delay_ms);
    }

    /// Advances the timer by one frame.
    ///
    /// Returns true exactly once: on the frame where the counter first
    /// reaches `target_frames`. Untimed phases never fire.
    pub fn advance(&mut self) -> bool {
        let was_below = self.frame_counter < self.target_frames;
        self.frame_counter = self.frame_counter.saturating_add(1);
        was_below && self.frame_counter >= self.target_frames
    }

    /// Back to an untimed NORMAL.
    pub fn reset(&mut self) {
        self.current = Phase::Normal;
        self.data = Map::new();
        self.frame_counter = 0;
        self.target_frames = 0;
    }

    pub fn data_u32(&self, key: &str) -> Option<u32> {
        self.data.get(key)?.as_u64().map(|v| v as u32)
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key)?.as_bool()
    }
}

/// Container-facing phase operations.
#[derive(Debug, Clone, Copy)]
pub struct PhaseMachine {
    frame_delay_ms: u64,
}

impl PhaseMachine {
    pub fn new(frame_delay_ms: u64) -> Self {
        Self { frame_delay_ms }
    }

    pub fn frame_delay_ms(&self) -> u64 {
        self.frame_delay_ms
    }

    /// Enters `phase` through the container.
    pub fn set_phase(
        &self,
        state: &mut StateContainer,
        phase: Phase,
        data: Map<String, Value>,
        duration_ms: u64,
    ) -> NotifyReport {
        let mut next = state.state().phase.clone();
        next.enter(phase, data, duration_ms, self.frame_delay_ms);
        write_phase(state, next, "set_phase")
    }

    /// Advances the phase timer; true on the frame the timer completes.
    pub fn advance_phase_timer(&self, state: &mut StateContainer) -> bool {
        let mut next = state.state().phase.clone();
        if next.target_frames == 0 {
            return false;
        }
        let fired = next.advance();
        write_phase(state, next, "phase_timer");
        fired
    }

    /// Forces NORMAL with a zero timer.
    pub fn reset_phase(&self, state: &mut StateContainer) -> NotifyReport {
        let mut next = state.state().phase.clone();
        next.reset();
        write_phase(state, next, "reset_phase")
    }
}

fn write_phase(state: &mut StateContainer, phase: PhaseState, reason: &str) -> NotifyReport {
    match state.set(StatePath::Phase, StateValue::Phase(phase), reason) {
        Ok(report) => report,
        Err(e) => {
            warn!("{} could not write phase: {}", reason, e);
            NotifyReport::default()
        }
    }
}
