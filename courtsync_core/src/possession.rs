//! Possession System.
//!
//! Every possession transfer is one `mutate` batch on the State Container
//! (team, carrier, shot clock and gates change together) followed by the
//! matching event. A roster with nobody on the receiving team still
//! produces the event, with `carrier: None`, so the watchdogs can recover.

use crate::actor::{ActorId, Team};
use crate::config::{CourtGeometry, SyncConfig};
use crate::events::{EventBus, GameEvent, PossessionReason};
use crate::phase::Phase;
use crate::state::{SessionState, StateContainer, StateError};
use nalgebra::Vector2;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Distance the receiver stands in front of the inbounder.
const RECEIVER_OFFSET: f64 = 8.0;
/// Distance defenders give the receiver.
const DEFENDER_OFFSET: f64 = 4.0;
/// Lateral spacing between defenders.
const DEFENDER_SPACING: f64 = 5.0;

/// Result of an inbound setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InboundAssignment {
    pub team: Team,
    pub inbounder: Option<ActorId>,
    pub receiver: Option<ActorId>,
}

/// Possession transfer rules.
#[derive(Debug, Clone)]
pub struct PossessionSystem {
    default_shot_clock: f64,
    court: CourtGeometry,
    inbound_setup_ms: u64,
    frame_delay_ms: u64,
}

impl PossessionSystem {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            default_shot_clock: config.default_shot_clock,
            court: config.court.clone(),
            inbound_setup_ms: config.phase_timing.inbound_setup_ms,
            frame_delay_ms: config.frame_delay_ms,
        }
    }

    /// Hands the ball to the other team.
    ///
    /// The carrier is `preferred` if it is on the new team, else the current
    /// carrier if already on the new team (a steal), else the new team's
    /// actor nearest its inbound spot.
    pub fn switch_possession(
        &self,
        state: &mut StateContainer,
        events: &mut EventBus,
        reason: PossessionReason,
        preferred: Option<ActorId>,
    ) -> Option<ActorId> {
        let old_team = state.state().current_team;
        let new_team = old_team.opponent();
        let spot = self.court.inbound_spot(new_team);
        let shot_clock = self.default_shot_clock;

        let mut carrier = None;
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                let on_new_team = |id: ActorId, s: &SessionState| s.roster.team_of(id) == Some(new_team);

                carrier = match (preferred, s.ball_carrier) {
                    (Some(id), _) if on_new_team(id, s) => Some(id),
                    (_, Some(id)) if on_new_team(id, s) => Some(id),
                    _ => s.roster.nearest(new_team, &spot, None),
                };

                s.current_team = new_team;
                s.ball_carrier = carrier;
                s.rebound_active = false;
                s.shot_clock = shot_clock;
                s.frontcourt_established = false;
                if let Some(pos) = carrier.and_then(|id| s.roster.get(id)).map(|a| a.position) {
                    s.ball_position = pos;
                }
                Ok(())
            },
            "switch_possession",
        );

        if let Err(e) = result {
            warn!("switch_possession failed: {}", e);
            carrier = None;
        }
        if carrier.is_none() {
            warn!("no carrier available on {} after {}", new_team, reason.as_str());
        }

        debug!("possession {} -> {} ({})", old_team, new_team, reason.as_str());
        events.emit(GameEvent::PossessionChange {
            old_team,
            new_team,
            reason,
            carrier,
        });
        carrier
    }

    /// Sets up a baseline inbound for the team that did not score.
    ///
    /// Positions the inbounder on the spot, the receiver in front of it and
    /// the defenders downcourt of the receiver, then enters INBOUND_SETUP.
    pub fn setup_inbound(
        &self,
        state: &mut StateContainer,
        events: &mut EventBus,
        scoring_team: Team,
        reason: PossessionReason,
    ) -> InboundAssignment {
        let team = scoring_team.opponent();
        let old_team = state.state().current_team;
        let spot = self.court.inbound_spot(team);
        let forward = self.court.attack_direction(team);
        let court = self.court.clone();
        let shot_clock = self.default_shot_clock;
        let (setup_ms, frame_delay) = (self.inbound_setup_ms, self.frame_delay_ms);

        let mut assignment = InboundAssignment {
            team,
            inbounder: None,
            receiver: None,
        };

        let result = state.mutate(
            |s| -> Result<(), StateError> {
                let inbounder = s.roster.nearest(team, &spot, None);
                let receiver = s.roster.nearest(team, &spot, inbounder);

                if let Some(actor) = inbounder.and_then(|id| s.roster.get_mut(id)) {
                    actor.position = spot;
                }
                let receiver_pos = court.clamp(spot + forward * RECEIVER_OFFSET);
                if let Some(actor) = receiver.and_then(|id| s.roster.get_mut(id)) {
                    actor.position = receiver_pos;
                }

                let defenders = s.roster.ranked_by_distance(team.opponent(), &receiver_pos);
                let half = (defenders.len() as f64 - 1.0) / 2.0;
                for (i, id) in defenders.into_iter().enumerate() {
                    let lateral = Vector2::new(0.0, (i as f64 - half) * DEFENDER_SPACING);
                    if let Some(actor) = s.roster.get_mut(id) {
                        actor.position = court.clamp(receiver_pos + forward * DEFENDER_OFFSET + lateral);
                    }
                }

                s.current_team = team;
                s.ball_carrier = inbounder;
                s.ball_position = spot;
                s.inbounding = true;
                s.rebound_active = false;
                s.frontcourt_established = false;
                s.shot_clock = shot_clock;

                let mut data = Map::new();
                if let Some(id) = inbounder {
                    data.insert("inbounder".into(), Value::from(id.0));
                }
                if let Some(id) = receiver {
                    data.insert("receiver".into(), Value::from(id.0));
                }
                s.phase.enter(Phase::InboundSetup, data, setup_ms, frame_delay);

                assignment.inbounder = inbounder;
                assignment.receiver = receiver;
                Ok(())
            },
            "setup_inbound",
        );
        if let Err(e) = result {
            warn!("setup_inbound failed: {}", e);
        }

        if old_team != team {
            events.emit(GameEvent::PossessionChange {
                old_team,
                new_team: team,
                reason,
                carrier: assignment.inbounder,
            });
        }
        events.emit(GameEvent::InboundSetup {
            inbounding_team: team,
            inbounder: assignment.inbounder,
            receiver: assignment.receiver,
            reason,
        });
        assignment
    }

    /// Completes an inbound pass: the receiver takes the ball and play resumes.
    ///
    /// Falls back to the inbounder (or nobody) when no receiver was recorded.
    pub fn complete_inbound(&self, state: &mut StateContainer) -> Option<ActorId> {
        let mut carrier = None;
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                let receiver = s
                    .phase
                    .data_u32("receiver")
                    .map(ActorId)
                    .filter(|id| s.roster.contains(*id));
                carrier = receiver.or(s.ball_carrier);

                s.ball_carrier = carrier;
                if let Some(pos) = carrier.and_then(|id| s.roster.get(id)).map(|a| a.position) {
                    s.ball_position = pos;
                }
                s.inbounding = false;
                s.phase.reset();
                Ok(())
            },
            "complete_inbound",
        );
        if let Err(e) = result {
            warn!("complete_inbound failed: {}", e);
        }
        carrier
    }

    /// A loose ball was secured by `actor`.
    ///
    /// Secured by the defense: possession switches with `actor` as carrier.
    /// Secured by the offense: the offense keeps the ball and the shot clock
    /// resets.
    pub fn gain_loose_ball(
        &self,
        state: &mut StateContainer,
        events: &mut EventBus,
        actor: ActorId,
        reason: PossessionReason,
    ) {
        let Some(team) = state.state().roster.team_of(actor) else {
            warn!("loose ball secured by unknown actor {}", actor);
            return;
        };

        if team != state.state().current_team {
            self.switch_possession(state, events, reason, Some(actor));
            return;
        }

        let shot_clock = self.default_shot_clock;
        let result = state.mutate(
            |s| -> Result<(), StateError> {
                s.ball_carrier = Some(actor);
                if let Some(pos) = s.roster.get(actor).map(|a| a.position) {
                    s.ball_position = pos;
                }
                s.rebound_active = false;
                s.shot_clock = shot_clock;
                Ok(())
            },
            "offensive_rebound",
        );
        if let Err(e) = result {
            warn!("gain_loose_ball failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Roster};
    use crate::events::EventKind;
    use proptest::prelude::*;

    fn setup(per_team: u32) -> (StateContainer, EventBus, PossessionSystem, SyncConfig) {
        let config = SyncConfig::default();
        let roster = Roster::two_teams(per_team, &config.court, 100.0);
        let state = StateContainer::new(SessionState::new(roster, &config));
        (state, EventBus::new(), PossessionSystem::new(&config), config)
    }

    #[test]
    fn test_switch_possession_resets_clock_and_rebound() {
        let (mut state, mut events, possession, config) = setup(2);
        state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.shot_clock = 3.2;
                    s.rebound_active = true;
                    s.ball_carrier = Some(ActorId(0));
                    Ok(())
                },
                "prep",
            )
            .unwrap();

        let carrier = possession.switch_possession(&mut state, &mut events, PossessionReason::Turnover, None);

        let s = state.state();
        assert_eq!(s.current_team, Team::TeamB);
        assert_eq!(s.shot_clock, config.default_shot_clock);
        assert!(!s.rebound_active);
        assert!(carrier.is_some());
        assert_eq!(s.roster.team_of(carrier.unwrap()), Some(Team::TeamB));
        assert_eq!(events.count(EventKind::PossessionChange), 1);
    }

    #[test]
    fn test_steal_preserves_carrier_on_new_team() {
        let (mut state, mut events, possession, _) = setup(2);
        // TeamB actor 3 already holds the ball (stolen)
        state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.ball_carrier = Some(ActorId(3));
                    Ok(())
                },
                "steal",
            )
            .unwrap();

        let carrier = possession.switch_possession(&mut state, &mut events, PossessionReason::Steal, None);

        assert_eq!(carrier, Some(ActorId(3)));
        assert_eq!(state.state().ball_carrier, Some(ActorId(3)));
    }

    #[test]
    fn test_switch_without_candidates_still_emits() {
        let config = SyncConfig::default();
        let mut roster = Roster::new();
        roster.insert(Actor::new(ActorId(0), Team::TeamA, Vector2::new(10.0, 10.0), 100.0));
        let mut state = StateContainer::new(SessionState::new(roster, &config));
        let mut events = EventBus::new();
        let possession = PossessionSystem::new(&config);

        let carrier = possession.switch_possession(&mut state, &mut events, PossessionReason::Turnover, None);

        assert_eq!(carrier, None);
        assert_eq!(state.state().ball_carrier, None);
        match events.last_of(EventKind::PossessionChange) {
            Some(GameEvent::PossessionChange { carrier, new_team, .. }) => {
                assert_eq!(*carrier, None);
                assert_eq!(*new_team, Team::TeamB);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_setup_inbound_gives_ball_to_non_scorer() {
        let (mut state, mut events, possession, config) = setup(3);

        let assignment = possession.setup_inbound(&mut state, &mut events, Team::TeamA, PossessionReason::Score);

        let s = state.state();
        assert_eq!(assignment.team, Team::TeamB);
        assert_eq!(s.current_team, Team::TeamB);
        assert!(s.inbounding);
        assert_eq!(s.phase.current, Phase::InboundSetup);
        assert_eq!(s.ball_carrier, assignment.inbounder);

        let inbounder = s.roster.get(assignment.inbounder.unwrap()).unwrap();
        assert_eq!(inbounder.position, config.court.inbound_spot(Team::TeamB));
        assert_ne!(assignment.inbounder, assignment.receiver);
        assert_eq!(events.count(EventKind::InboundSetup), 1);
        assert_eq!(events.count(EventKind::PossessionChange), 1);
    }

    #[test]
    fn test_complete_inbound_hands_ball_to_receiver() {
        let (mut state, mut events, possession, _) = setup(3);
        let assignment = possession.setup_inbound(&mut state, &mut events, Team::TeamB, PossessionReason::Score);

        let carrier = possession.complete_inbound(&mut state);

        assert_eq!(carrier, assignment.receiver);
        assert!(!state.state().inbounding);
        assert_eq!(state.state().phase.current, Phase::Normal);
    }

    #[test]
    fn test_offensive_rebound_keeps_team() {
        let (mut state, mut events, possession, config) = setup(2);
        state
            .mutate(
                |s| -> Result<(), StateError> {
                    s.shot_clock = 1.0;
                    s.rebound_active = true;
                    Ok(())
                },
                "prep",
            )
            .unwrap();

        possession.gain_loose_ball(&mut state, &mut events, ActorId(1), PossessionReason::Rebound);

        let s = state.state();
        assert_eq!(s.current_team, Team::TeamA);
        assert_eq!(s.ball_carrier, Some(ActorId(1)));
        assert_eq!(s.shot_clock, config.default_shot_clock);
        assert_eq!(events.count(EventKind::PossessionChange), 0);
    }

    proptest! {
        #[test]
        fn prop_switch_always_resets(clock in 0.0f64..24.0, rebound in any::<bool>(), team_b in any::<bool>()) {
            let (mut state, mut events, possession, config) = setup(2);
            state.mutate(|s| -> Result<(), StateError> {
                s.shot_clock = clock;
                s.rebound_active = rebound;
                s.current_team = if team_b { Team::TeamB } else { Team::TeamA };
                Ok(())
            }, "prep").unwrap();

            possession.switch_possession(&mut state, &mut events, PossessionReason::Turnover, None);

            prop_assert_eq!(state.state().shot_clock, config.default_shot_clock);
            prop_assert!(!state.state().rebound_active);
        }
    }
}
