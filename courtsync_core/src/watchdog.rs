//! Watchdog safety nets.
//!
//! Two frame-counted detectors, checked once per simulation frame:
//! - **null carrier**: nobody holds the ball outside a shot, rebound or
//!   scripted stoppage
//! - **stale inbound**: `inbounding` is set but the inbound timer is not
//!   making progress
//!
//! Reaching a limit spawns a loose-ball scramble through a
//! [`ScrambleSpawner`] and resets that counter. The limits are tens of
//! frames so a legitimate gap (a pass in flight) never trips them.

use crate::config::SyncConfig;
use crate::events::{EventBus, GameEvent, ScrambleCause};
use crate::phase::{Phase, PhaseState};
use crate::state::{StateContainer, StateError, StatePath, StateValue};
use nalgebra::Vector2;
use serde_json::{json, Map};
use tracing::{info, warn};

/// Creates loose-ball scrambles.
pub trait ScrambleSpawner {
    /// Puts the ball up for grabs at (`x`, `y`).
    fn create_rebound(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        x: f64,
        y: f64,
        is_loose_ball: bool,
        cause: ScrambleCause,
    );
}

/// Default spawner: enters REBOUND_SCRAMBLE with no carrier.
#[derive(Debug, Clone)]
pub struct LooseBallScramble {
    scramble_ms: u64,
    frame_delay_ms: u64,
}

impl LooseBallScramble {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            scramble_ms: config.phase_timing.rebound_scramble_ms,
            frame_delay_ms: config.frame_delay_ms,
        }
    }
}

impl ScrambleSpawner for LooseBallScramble {
    fn create_rebound(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        x: f64,
        y: f64,
        is_loose_ball: bool,
        cause: ScrambleCause,
    ) {
        let (scramble_ms, frame_delay) = (self.scramble_ms, self.frame_delay_ms);
        let position = Vector2::new(x, y);

        let result = state.mutate(
            |s| -> Result<(), StateError> {
                let mut data = Map::new();
                data.insert("looseBall".into(), json!(is_loose_ball));
                s.phase.enter(Phase::ReboundScramble, data, scramble_ms, frame_delay);
                s.ball_carrier = None;
                s.ball_position = position;
                s.rebound_active = true;
                Ok(())
            },
            "create_rebound",
        );
        if let Err(e) = result {
            warn!("create_rebound failed: {}", e);
            return;
        }

        events.emit(GameEvent::LooseBallScramble { position, cause });
    }
}

/// Which detectors fired this frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub null_carrier_fired: bool,
    pub stale_inbound_fired: bool,
}

/// Per-peer watchdog counters.
#[derive(Debug, Clone)]
pub struct Watchdog {
    null_carrier_limit: u32,
    stale_inbound_limit: u32,
    null_carrier_frames: u32,
    stale_inbound_frames: u32,
    /// (phase, frame_counter) seen on the previous check
    last_progress: Option<(Phase, u32)>,
    triggers: u64,
}

impl Watchdog {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_limits(config.null_carrier_frame_limit, config.stale_inbound_frame_limit)
    }

    pub fn with_limits(null_carrier_limit: u32, stale_inbound_limit: u32) -> Self {
        Self {
            null_carrier_limit: null_carrier_limit.max(1),
            stale_inbound_limit: stale_inbound_limit.max(1),
            null_carrier_frames: 0,
            stale_inbound_frames: 0,
            last_progress: None,
            triggers: 0,
        }
    }

    pub fn null_carrier_frames(&self) -> u32 {
        self.null_carrier_frames
    }

    pub fn stale_inbound_frames(&self) -> u32 {
        self.stale_inbound_frames
    }

    /// Total recoveries forced since creation.
    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    /// Runs both detectors for one frame.
    pub fn check(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        spawner: &mut dyn ScrambleSpawner,
    ) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        let s = state.state();
        let phase = s.phase.current;

        // Mid-shot or mid-rebound: both stand down
        if phase.is_shot_or_rebound_in_progress() {
            self.null_carrier_frames = 0;
            self.stale_inbound_frames = 0;
            self.last_progress = None;
            return report;
        }

        let ball = s.ball_position;
        let null_carrier = s.ball_carrier.is_none() && !phase.is_stoppage();
        let stale_inbound = s.inbounding && !self.inbound_progressed(&s.phase);

        // === Stale inbound ===
        if stale_inbound {
            self.stale_inbound_frames += 1;
            if self.stale_inbound_frames >= self.stale_inbound_limit {
                warn!(
                    "stale inbound for {} frames, forcing scramble at ({:.1}, {:.1})",
                    self.stale_inbound_frames, ball.x, ball.y
                );
                if let Err(e) = state.set(StatePath::Inbounding, StateValue::Flag(false), "stale_inbound") {
                    warn!("failed to clear inbounding: {}", e);
                }
                self.fire(state, events, spawner, ball, ScrambleCause::StaleInbound);
                self.stale_inbound_frames = 0;
                self.null_carrier_frames = 0;
                report.stale_inbound_fired = true;
                return report;
            }
        } else {
            self.stale_inbound_frames = 0;
        }

        // === Null carrier ===
        if null_carrier {
            self.null_carrier_frames += 1;
            if self.null_carrier_frames >= self.null_carrier_limit {
                warn!(
                    "no ball carrier for {} frames, forcing scramble at ({:.1}, {:.1})",
                    self.null_carrier_frames, ball.x, ball.y
                );
                self.fire(state, events, spawner, ball, ScrambleCause::NullCarrier);
                self.null_carrier_frames = 0;
                report.null_carrier_fired = true;
            }
        } else {
            self.null_carrier_frames = 0;
        }

        report
    }

    /// True when the inbound timer moved since the last check and has not
    /// yet expired.
    fn inbound_progressed(&mut self, phase: &PhaseState) -> bool {
        let signature = (phase.current, phase.frame_counter);
        let moved = self.last_progress != Some(signature);
        self.last_progress = Some(signature);
        moved && phase.current.is_inbound() && phase.frame_counter <= phase.target_frames
    }

    fn fire(
        &mut self,
        state: &mut StateContainer,
        events: &mut EventBus,
        spawner: &mut dyn ScrambleSpawner,
        ball: Vector2<f64>,
        cause: ScrambleCause,
    ) {
        self.triggers += 1;
        self.last_progress = None;
        spawner.create_rebound(state, events, ball.x, ball.y, true, cause);

        let record = json!({ "triggers": self.triggers, "lastCause": format!("{:?}", cause) });
        if let Err(e) = state.set(
            StatePath::extension("looseBallSafetyNet"),
            StateValue::Json(record),
            "watchdog",
        ) {
            warn!("failed to record watchdog trigger: {}", e);
        }
        info!("watchdog recovery #{} ({:?})", self.triggers, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorId, Roster};
    use crate::state::SessionState;

    #[derive(Default)]
    struct CountingSpawner {
        calls: Vec<(f64, f64, ScrambleCause)>,
    }

    impl ScrambleSpawner for CountingSpawner {
        fn create_rebound(
            &mut self,
            _state: &mut StateContainer,
            _events: &mut EventBus,
            x: f64,
            y: f64,
            _is_loose_ball: bool,
            cause: ScrambleCause,
        ) {
            self.calls.push((x, y, cause));
        }
    }

    fn container() -> StateContainer {
        let config = SyncConfig::default();
        let roster = Roster::two_teams(2, &config.court, 100.0);
        StateContainer::new(SessionState::new(roster, &config))
    }

    #[test]
    fn test_null_carrier_triggers_on_limit() {
        let limit = 5;
        let mut watchdog = Watchdog::with_limits(limit, 100);
        let mut state = container();
        let mut events = EventBus::new();
        let mut spawner = CountingSpawner::default();

        for _ in 0..(limit - 1) {
            let report = watchdog.check(&mut state, &mut events, &mut spawner);
            assert!(!report.null_carrier_fired);
        }
        assert!(spawner.calls.is_empty());
        assert_eq!(watchdog.null_carrier_frames(), limit - 1);

        let report = watchdog.check(&mut state, &mut events, &mut spawner);
        assert!(report.null_carrier_fired);
        assert_eq!(spawner.calls.len(), 1);
        assert_eq!(spawner.calls[0].2, ScrambleCause::NullCarrier);
        assert_eq!(watchdog.null_carrier_frames(), 0);
    }

    #[test]
    fn test_null_carrier_resets_when_ball_held() {
        let mut watchdog = Watchdog::with_limits(3, 100);
        let mut state = container();
        let mut events = EventBus::new();
        let mut spawner = CountingSpawner::default();

        watchdog.check(&mut state, &mut events, &mut spawner);
        watchdog.check(&mut state, &mut events, &mut spawner);
        state
            .set(StatePath::BallCarrier, StateValue::Carrier(Some(ActorId(0))), "pickup")
            .unwrap();
        watchdog.check(&mut state, &mut events, &mut spawner);

        assert_eq!(watchdog.null_carrier_frames(), 0);
        assert!(spawner.calls.is_empty());
    }

    #[test]
    fn test_stands_down_during_rebound() {
        let mut watchdog = Watchdog::with_limits(2, 2);
        let mut state = container();
        let mut events = EventBus::new();
        let mut spawner = CountingSpawner::default();

        let mut phase = PhaseState::default();
        phase.enter(Phase::ReboundScramble, Map::new(), 900, 50);
        state.set(StatePath::Phase, StateValue::Phase(phase), "scramble").unwrap();

        for _ in 0..10 {
            watchdog.check(&mut state, &mut events, &mut spawner);
        }
        assert!(spawner.calls.is_empty());
    }

    #[test]
    fn test_stale_inbound_clears_flag_and_scrambles() {
        let mut watchdog = Watchdog::with_limits(1000, 4);
        let mut state = container();
        let mut events = EventBus::new();
        let mut spawner = LooseBallScramble::new(&SyncConfig::default());

        state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.inbounding = true;
                    s.ball_carrier = Some(ActorId(0));
                    Ok(())
                },
                "stuck inbound",
            )
            .unwrap();

        let mut fired = 0;
        for _ in 0..4 {
            if watchdog.check(&mut state, &mut events, &mut spawner).stale_inbound_fired {
                fired += 1;
            }
        }

        assert_eq!(fired, 1);
        let s = state.state();
        assert!(!s.inbounding);
        assert_eq!(s.phase.current, Phase::ReboundScramble);
        assert_eq!(s.ball_carrier, None);
        assert!(s.rebound_active);
        assert_eq!(events.count(crate::events::EventKind::LooseBallScramble), 1);
        assert_eq!(
            state.get(&StatePath::extension("looseBallSafetyNet.triggers")),
            Some(StateValue::Json(json!(1)))
        );
    }

    #[test]
    fn test_progressing_inbound_is_not_stale() {
        let mut watchdog = Watchdog::with_limits(1000, 3);
        let mut state = container();
        let mut events = EventBus::new();
        let mut spawner = CountingSpawner::default();

        let mut phase = PhaseState::default();
        phase.enter(Phase::InboundWalk, Map::new(), 1000, 50);
        state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.inbounding = true;
                    s.ball_carrier = Some(ActorId(0));
                    s.phase = phase;
                    Ok(())
                },
                "inbound",
            )
            .unwrap();

        for _ in 0..10 {
            let mut next = state.state().phase.clone();
            next.advance();
            state.set(StatePath::Phase, StateValue::Phase(next), "tick").unwrap();
            watchdog.check(&mut state, &mut events, &mut spawner);
        }
        assert_eq!(watchdog.stale_inbound_frames(), 0);
        assert!(spawner.calls.is_empty());
    }
}
