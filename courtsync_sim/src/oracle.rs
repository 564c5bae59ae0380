//! Session oracle for simulation.
//!
//! The oracle watches every live peer after each frame and records
//! violations of the properties a healthy session keeps:
//! - At most one coordinator per epoch, ever
//! - The ball carrier plays for the team in possession
//! - No ball-less stall outlives the watchdog limits
//! - After faults heal, followers agree with the coordinator

use crate::world::SimWorld;

use courtsync_core::authority::PeerRole;
use courtsync_core::{SessionState, SyncConfig};
use courtsync_core::phase::PhaseState;
use courtsync_env::PeerId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Extra frames tolerated on top of a watchdog limit.
const STALL_SLACK_FRAMES: u32 = 10;

/// One recorded invariant violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub tick: u64,
    pub message: String,
}

/// Ground-truth observer of a running session.
pub struct SessionOracle {
    /// Who coordinated at each epoch
    epoch_owners: BTreeMap<u64, PeerId>,

    /// Coordinator observed last frame; stall counters reset on change
    last_coordinator: Option<PeerId>,

    null_carrier_frames: u32,
    stuck_inbound_frames: u32,

    null_carrier_bound: u32,
    stuck_inbound_bound: u32,

    longest_stall: u32,
    violations: Vec<Violation>,
}

impl SessionOracle {
    pub fn new(config: &SyncConfig) -> Self {
        let scramble = PhaseState::target_frames_for(
            config.phase_timing.rebound_scramble_ms,
            config.frame_delay_ms,
        );
        Self {
            epoch_owners: BTreeMap::new(),
            last_coordinator: None,
            null_carrier_frames: 0,
            stuck_inbound_frames: 0,
            null_carrier_bound: config.null_carrier_frame_limit + STALL_SLACK_FRAMES,
            // A stuck inbound may first burn a null-carrier scramble
            stuck_inbound_bound: config.stale_inbound_frame_limit
                + config.null_carrier_frame_limit
                + 2 * scramble
                + STALL_SLACK_FRAMES,
            longest_stall: 0,
            violations: Vec::new(),
        }
    }

    /// Checks every per-frame property against the world as it stands.
    pub fn observe(&mut self, world: &SimWorld) {
        let tick = world.tick_count();

        for peer in world.peers() {
            let inner = peer.inner();
            if inner.role() != PeerRole::Coordinator {
                continue;
            }
            let epoch = inner.epoch();
            let claimant = peer.peer_id().clone();
            match self.epoch_owners.get(&epoch) {
                Some(owner) if *owner != claimant => {
                    self.violate(tick, format!("{} and {} both coordinate epoch {}", owner, claimant, epoch));
                }
                Some(_) => {}
                None => {
                    self.epoch_owners.insert(epoch, claimant);
                }
            }
        }

        let coordinators = world.coordinators();
        let Some(coordinator) = coordinators.first() else {
            return;
        };
        if self.last_coordinator.as_ref() != Some(coordinator) {
            self.last_coordinator = Some(coordinator.clone());
            self.null_carrier_frames = 0;
            self.stuck_inbound_frames = 0;
        }
        let Some(peer) = world.peer(coordinator) else {
            return;
        };
        let state = peer.inner().state().state().clone();

        self.check_carrier(tick, &state);
        self.check_stalls(tick, &state);
    }

    fn check_carrier(&mut self, tick: u64, state: &SessionState) {
        let Some(carrier) = state.ball_carrier else {
            return;
        };
        match state.roster.team_of(carrier) {
            Some(team) if team == state.current_team => {}
            Some(team) => self.violate(
                tick,
                format!("carrier {} plays for {} but {} has possession", carrier, team, state.current_team),
            ),
            None => self.violate(tick, format!("carrier {} is not on the roster", carrier)),
        }
    }

    fn check_stalls(&mut self, tick: u64, state: &SessionState) {
        let phase = state.phase.current;

        let null_carrier =
            state.ball_carrier.is_none() && !phase.is_shot_or_rebound_in_progress() && !phase.is_stoppage();
        self.null_carrier_frames = if null_carrier { self.null_carrier_frames + 1 } else { 0 };

        let stuck_inbound = state.inbounding && !phase.is_inbound();
        self.stuck_inbound_frames = if stuck_inbound { self.stuck_inbound_frames + 1 } else { 0 };

        self.longest_stall = self
            .longest_stall
            .max(self.null_carrier_frames)
            .max(self.stuck_inbound_frames);

        if self.null_carrier_frames == self.null_carrier_bound + 1 {
            self.violate(tick, format!("no carrier for {} frames", self.null_carrier_frames));
        }
        if self.stuck_inbound_frames == self.stuck_inbound_bound + 1 {
            self.violate(tick, format!("inbound stuck for {} frames", self.stuck_inbound_frames));
        }
    }

    /// Followers must report the coordinator's score and possession.
    ///
    /// Call once faults are healed and the session has settled.
    pub fn check_convergence(&mut self, world: &SimWorld) -> bool {
        let tick = world.tick_count();
        let coordinators = world.coordinators();
        let Some(reference) = coordinators.first().and_then(|id| world.peer(id)) else {
            self.violate(tick, "no coordinator at convergence check".to_string());
            return false;
        };
        let truth = reference.inner().state().state();

        let mut converged = true;
        let mut mismatches = Vec::new();
        for peer in world.peers() {
            if peer.inner().role() == PeerRole::Coordinator {
                continue;
            }
            let view = peer.inner().state().state();
            if view.score != truth.score {
                converged = false;
                mismatches.push(format!(
                    "{} sees {}-{} but coordinator has {}-{}",
                    peer.peer_id(),
                    view.score.team_a,
                    view.score.team_b,
                    truth.score.team_a,
                    truth.score.team_b
                ));
            }
        }
        for message in mismatches {
            self.violate(tick, message);
        }
        converged
    }

    /// Longest ball-less or stuck-inbound run seen, in frames.
    pub fn longest_stall(&self) -> u32 {
        self.longest_stall
    }

    /// Highest epoch any coordinator claimed.
    pub fn max_epoch(&self) -> u64 {
        self.epoch_owners.keys().next_back().copied().unwrap_or(0)
    }

    pub fn epoch_owners(&self) -> &BTreeMap<u64, PeerId> {
        &self.epoch_owners
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn violate(&mut self, tick: u64, message: String) {
        tracing::warn!("invariant violated at tick {}: {}", tick, message);
        self.violations.push(Violation { tick, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimConfig;
    use courtsync_core::ActorId;

    fn sync() -> SyncConfig {
        let mut sync = SyncConfig::default();
        sync.health_check_interval = 2;
        sync.adaptive_tuning = false;
        sync
    }

    #[tokio::test]
    async fn test_clean_run_has_no_violations() {
        let mut world = SimWorld::new(SimConfig {
            seed: 3,
            num_peers: 3,
            sync: sync(),
            ..Default::default()
        });
        world.spawn_peers().await.unwrap();
        let mut oracle = SessionOracle::new(&world.config.sync);

        for _ in 0..200 {
            world.step().await;
            oracle.observe(&world);
        }

        assert!(oracle.is_clean(), "{:?}", oracle.violations());
        assert_eq!(oracle.epoch_owners().get(&1), Some(&PeerId::new("p1")));
    }

    #[tokio::test]
    async fn test_wrong_team_carrier_is_flagged() {
        let mut world = SimWorld::new(SimConfig {
            seed: 3,
            num_peers: 1,
            sync: sync(),
            ..Default::default()
        });
        world.spawn_peers().await.unwrap();
        let mut oracle = SessionOracle::new(&world.config.sync);

        let p1 = PeerId::new("p1");
        let state = world.peer_mut(&p1).unwrap().inner_mut().state_mut();
        let current = state.state().current_team;
        let wrong = state
            .state()
            .roster
            .iter()
            .find(|a| a.team != current)
            .map(|a| a.id)
            .unwrap_or(ActorId(0));
        state
            .mutate(
                |s| -> Result<(), String> {
                    s.ball_carrier = Some(wrong);
                    Ok(())
                },
                "test",
            )
            .unwrap();

        oracle.observe(&world);
        assert_eq!(oracle.violations().len(), 1);
    }
}
