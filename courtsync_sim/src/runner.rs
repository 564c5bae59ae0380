//! Scenario runner - executes fault scenarios against a live session.
//!
//! Every scenario has the same shape:
//!
//! ```text
//! spawn peers ──► play (faults injected on schedule) ──► heal ──► settle ──► verify
//!                   │                                                │
//!                   └──────── oracle observes every frame ───────────┘
//! ```
//!
//! Settling runs with idle bots so no new shot is in flight when the
//! follower views are compared against the coordinator.

use crate::exporter::{SimEvent, SimExport};
use crate::oracle::SessionOracle;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, MAX_PEERS};

use courtsync_core::authority::PeerRole;
use courtsync_core::{NetworkQuality, SyncConfig};
use courtsync_env::{PeerId, StoreController};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Follower read latency in the high-latency scenario.
const HIGH_LATENCY_MS: u64 = 250;
/// Follower read loss in the lossy-store scenario.
const LOSSY_READ_RATE: f64 = 0.2;
/// How long the isolated follower stays cut off.
const ISOLATION_SECS: f64 = 3.0;
/// Spawn index of the peer that joins mid-game. As `p2` it sorts right
/// after the first coordinator, so it wins the next election.
const LATE_JOINER: usize = 1;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Peers still in the session at the end
    pub final_peer_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_peer_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub store_writes: u64,
    pub store_reads: u64,
    pub dropped_reads: u64,
    pub rejected_ops: u64,
    pub cas_conflicts: u64,

    pub snapshots_applied: u64,
    pub stale_snapshots: u64,
    pub inputs_applied: u64,
    pub publish_failures: u64,

    pub watchdog_triggers: u64,
    pub final_epoch: u64,
    pub longest_stall_frames: u32,

    pub score_team_a: u32,
    pub score_team_b: u32,

    /// Worst link quality any follower reported
    pub worst_quality: Option<NetworkQuality>,

    pub violations: usize,
}

/// Faults scheduled for one run, in frames.
#[derive(Debug, Clone, Default)]
struct FaultPlan {
    crash_at: Vec<u64>,
    /// (tick, spawn index) of a peer held back at start
    late_join: Option<(u64, usize)>,
    isolate: Option<(u64, u64)>,
    stall_at: Option<u64>,
    follower_latency_ms: Option<u64>,
    follower_loss: Option<f64>,
}

impl FaultPlan {
    fn for_scenario(scenario: ScenarioId, total: u64, frame_delay_ms: u64) -> Self {
        let mut plan = FaultPlan::default();
        match scenario {
            ScenarioId::SteadyPlay => {}
            ScenarioId::CoordinatorCrash => plan.crash_at.push(total / 3),
            ScenarioId::CascadeFailover => {
                plan.crash_at.push(total / 4);
                plan.crash_at.push(total / 2);
            }
            ScenarioId::LossyStore => plan.follower_loss = Some(LOSSY_READ_RATE),
            ScenarioId::HighLatency => plan.follower_latency_ms = Some(HIGH_LATENCY_MS),
            ScenarioId::StalledInbound => plan.stall_at = Some(total / 3),
            ScenarioId::Isolation => {
                let frames = (ISOLATION_SECS * 1000.0 / frame_delay_ms.max(1) as f64) as u64;
                plan.isolate = Some((total / 3, total / 3 + frames));
            }
            ScenarioId::LateJoinFailover => {
                plan.late_join = Some((total / 4, LATE_JOINER));
                plan.crash_at.push(total / 2);
            }
        }
        plan
    }
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Play duration in seconds
    max_duration_secs: f64,

    /// Idle time after faults heal, in seconds
    settle_secs: f64,

    /// Core tunables for every peer
    sync: SyncConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers,
            max_duration_secs: 30.0,
            settle_secs: 3.0,
            sync: SyncConfig::default(),
        }
    }

    /// Sets the play duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the settle time.
    pub fn with_settle(mut self, secs: f64) -> Self {
        self.settle_secs = secs;
        self
    }

    /// Replaces the core tunables.
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_inner(scenario, None)
    }

    /// Runs a scenario, capturing a frame every `interval` ticks.
    pub fn run_recorded(&self, scenario: ScenarioId, interval: u64) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.run_inner(scenario, Some((&mut export, interval.max(1))));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn run_inner(&self, scenario: ScenarioId, recorder: Option<(&mut SimExport, u64)>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => return ScenarioResult::failed(scenario, self.seed, format!("runtime: {}", e)),
        };
        runtime.block_on(self.execute(scenario, recorder))
    }

    async fn execute(&self, scenario: ScenarioId, mut recorder: Option<(&mut SimExport, u64)>) -> ScenarioResult {
        let num_peers = self.num_peers.max(scenario.min_peers()).min(MAX_PEERS);
        let config = SimConfig {
            seed: self.seed,
            num_peers,
            sync: self.sync.clone(),
            ..Default::default()
        };
        let frame_delay_ms = config.sync.frame_delay_ms.max(1);
        let frames_for = |secs: f64| (secs * 1000.0 / frame_delay_ms as f64) as u64;
        let play_ticks = frames_for(self.max_duration_secs);
        let settle_ticks = frames_for(self.settle_secs);

        let plan = FaultPlan::for_scenario(scenario, play_ticks, frame_delay_ms);
        let held_back: Vec<usize> = plan.late_join.iter().map(|(_, index)| *index).collect();

        let mut world = SimWorld::new(config);
        let ids = match world.spawn_peers_except(&held_back).await {
            Ok(ids) => ids,
            Err(e) => return ScenarioResult::failed(scenario, self.seed, e.to_string()),
        };
        let followers: Vec<PeerId> = ids.iter().skip(1).cloned().collect();
        let mut oracle = SessionOracle::new(&world.config.sync);
        let mut metrics = ScenarioMetrics::default();

        for peer in &followers {
            if let Some(latency) = plan.follower_latency_ms {
                world.controller.set_read_latency(peer, latency);
            }
            if let Some(loss) = plan.follower_loss {
                world.controller.set_read_loss(peer, loss);
            }
        }

        // === Play ===
        for tick in 0..play_ticks {
            let mut notes = Vec::new();

            if let Some((at, index)) = plan.late_join.filter(|(at, _)| *at == tick) {
                match world.join_peer(index).await {
                    Ok(id) => {
                        info!("  tick {}: {} joins", at, id);
                        notes.push(SimEvent::info(format!("{} joined", id)));
                    }
                    Err(e) => return ScenarioResult::failed(scenario, self.seed, e.to_string()),
                }
            }
            if plan.crash_at.contains(&tick) {
                if let Some(coordinator) = world.coordinators().first().cloned() {
                    info!("  tick {}: crashing coordinator {}", tick, coordinator);
                    if let Err(e) = world.crash_peer(&coordinator).await {
                        return ScenarioResult::failed(scenario, self.seed, e.to_string());
                    }
                    notes.push(SimEvent::warn(format!("crashed {}", coordinator)));
                }
            }
            if let Some((from, until)) = plan.isolate {
                if let Some(target) = followers.last() {
                    if tick == from {
                        info!("  tick {}: isolating {}", tick, target);
                        world.controller.isolate(target);
                        notes.push(SimEvent::warn(format!("isolated {}", target)));
                    } else if tick == until {
                        info!("  tick {}: healing {}", tick, target);
                        world.controller.heal_all();
                        notes.push(SimEvent::info(format!("healed {}", target)));
                    }
                }
            }
            if plan.stall_at == Some(tick) && inject_stall(&mut world) {
                notes.push(SimEvent::warn("inbound stalled".to_string()));
            }

            world.step().await;
            oracle.observe(&world);
            track_quality(&world, &mut metrics);

            if let Some((export, interval)) = recorder.as_mut() {
                if tick % *interval == 0 || !notes.is_empty() {
                    export.capture(&world, notes);
                }
            }
            if tick % 100 == 0 {
                debug!("  tick {} | peers={} | epoch={}", tick, world.peer_count(), oracle.max_epoch());
            }
        }

        // === Settle ===
        world.controller.heal_all();
        world.controller.clear_link_faults();
        for _ in 0..settle_ticks {
            world.idle_step().await;
            oracle.observe(&world);
        }
        if let Some((export, _)) = recorder.as_mut() {
            export.capture(&world, vec![SimEvent::info("settled")]);
        }

        // === Verify ===
        let converged = oracle.check_convergence(&world);
        collect_metrics(&world, &oracle, &mut metrics);

        let failure = verify(scenario, &world, &oracle, &metrics, converged, &followers)
            .or_else(|| plan.late_join.and_then(|(_, index)| verify_late_joiner(&world, &oracle, index)));
        if let Some(reason) = &failure {
            warn!("{} failed: {}", scenario.name(), reason);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure.is_none(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            final_peer_count: world.peer_count(),
            failure_reason: failure,
            metrics,
        }
    }
}

/// Freezes the coordinator in a ball-less inbound that no timer will finish.
fn inject_stall(world: &mut SimWorld) -> bool {
    let Some(coordinator) = world.coordinators().first().cloned() else {
        return false;
    };
    let Some(peer) = world.peer_mut(&coordinator) else {
        return false;
    };
    let result = peer.inner_mut().state_mut().mutate(
        |s| -> Result<(), String> {
            s.phase.reset();
            s.ball_carrier = None;
            s.inbounding = true;
            s.rebound_active = false;
            Ok(())
        },
        "inject_stall",
    );
    result.is_ok()
}

fn track_quality(world: &SimWorld, metrics: &mut ScenarioMetrics) {
    for peer in world.peers() {
        if peer.inner().role() == PeerRole::Coordinator {
            continue;
        }
        let quality = peer.inner().quality();
        metrics.worst_quality = Some(metrics.worst_quality.map_or(quality, |worst| worst.max(quality)));
    }
}

fn collect_metrics(world: &SimWorld, oracle: &SessionOracle, metrics: &mut ScenarioMetrics) {
    let store = world.controller.stats();
    metrics.store_writes = store.writes;
    metrics.store_reads = store.reads;
    metrics.dropped_reads = store.dropped_reads;
    metrics.rejected_ops = store.rejected;
    metrics.cas_conflicts = store.cas_conflicts;

    for peer in world.peers() {
        let stats = peer.inner().stats();
        metrics.snapshots_applied += stats.snapshots_applied;
        metrics.stale_snapshots += stats.stale_snapshots;
        metrics.inputs_applied += stats.inputs_applied;
        metrics.publish_failures += stats.publish_failures;
        if peer.inner().role() == PeerRole::Coordinator {
            let state = peer.inner().state().state();
            metrics.score_team_a = state.score.team_a;
            metrics.score_team_b = state.score.team_b;
            metrics.watchdog_triggers = peer.inner().flow().watchdog().triggers();
        }
    }

    metrics.final_epoch = oracle.max_epoch();
    metrics.longest_stall_frames = oracle.longest_stall();
    metrics.violations = oracle.violations().len();
}

/// Checks shared and scenario-specific expectations. Returns the first failure.
fn verify(
    scenario: ScenarioId,
    world: &SimWorld,
    oracle: &SessionOracle,
    metrics: &ScenarioMetrics,
    converged: bool,
    followers: &[PeerId],
) -> Option<String> {
    if let Some(violation) = oracle.violations().first() {
        return Some(format!(
            "{} violation(s); first at tick {}: {}",
            oracle.violations().len(),
            violation.tick,
            violation.message
        ));
    }
    let coordinators = world.coordinators();
    if coordinators.len() != 1 {
        return Some(format!("expected one coordinator, found {:?}", coordinators));
    }
    if !converged {
        return Some("followers did not converge".to_string());
    }

    match scenario {
        ScenarioId::SteadyPlay => {
            if world.peer_count() > 1 && metrics.snapshots_applied == 0 {
                return Some("no snapshot was ever applied".to_string());
            }
        }
        ScenarioId::CoordinatorCrash => {
            if metrics.final_epoch < 2 {
                return Some(format!("no failover (epoch {})", metrics.final_epoch));
            }
        }
        ScenarioId::CascadeFailover => {
            if metrics.final_epoch < 3 {
                return Some(format!("expected two failovers, epoch is {}", metrics.final_epoch));
            }
        }
        ScenarioId::LossyStore => {
            if metrics.dropped_reads == 0 {
                return Some("no read was dropped".to_string());
            }
        }
        ScenarioId::HighLatency => {
            let degraded = metrics.worst_quality.map_or(false, |q| q >= NetworkQuality::Fair);
            if !degraded {
                return Some(format!("link never degraded ({:?})", metrics.worst_quality));
            }
        }
        ScenarioId::StalledInbound => {
            if metrics.watchdog_triggers == 0 {
                return Some("watchdog never recovered the stall".to_string());
            }
        }
        ScenarioId::LateJoinFailover => {
            if metrics.final_epoch < 2 {
                return Some(format!("no failover (epoch {})", metrics.final_epoch));
            }
        }
        ScenarioId::Isolation => {
            let isolated = followers.last().and_then(|id| world.peer(id));
            let dropped = isolated.map_or(0, |p| p.inner().stats().reads_dropped);
            if dropped == 0 {
                return Some("isolated follower never missed a read".to_string());
            }
        }
    }
    None
}

/// The late joiner must hold its own actor and lead the final epoch.
fn verify_late_joiner(world: &SimWorld, oracle: &SessionOracle, index: usize) -> Option<String> {
    let late = PeerId::from_index(index);
    let Some(peer) = world.peer(&late) else {
        return Some(format!("{} is not in the session", late));
    };
    let Some(actor) = peer.inner().local_actor() else {
        return Some(format!("{} joined without an actor", late));
    };
    if let Some(other) = world
        .peers()
        .find(|p| p.peer_id() != &late && p.inner().local_actor() == Some(actor))
    {
        return Some(format!("{} and {} both drive {}", late, other.peer_id(), actor));
    }
    match oracle.epoch_owners().values().next_back() {
        Some(owner) if *owner == late => None,
        owner => Some(format!("final epoch led by {:?}, not {}", owner, late)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed, 4).with_duration(15.0)
    }

    #[test]
    fn test_steady_play_passes() {
        let result = runner(42).run(ScenarioId::SteadyPlay);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_peer_count, 4);
        assert!(result.metrics.snapshots_applied > 0);
    }

    #[test]
    fn test_coordinator_crash_fails_over() {
        let result = runner(42).run(ScenarioId::CoordinatorCrash);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_peer_count, 3);
        assert!(result.metrics.final_epoch >= 2);
    }

    #[test]
    fn test_stalled_inbound_recovers() {
        let result = runner(7).run(ScenarioId::StalledInbound);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.watchdog_triggers >= 1);
    }

    #[test]
    fn test_late_joiner_inherits_session() {
        let result = runner(42).run(ScenarioId::LateJoinFailover);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_peer_count, 3);
        assert!(result.metrics.final_epoch >= 2);
        assert!(result.metrics.snapshots_applied > 0);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let a = runner(11).run(ScenarioId::LossyStore);
        let b = runner(11).run(ScenarioId::LossyStore);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.metrics.dropped_reads, b.metrics.dropped_reads);
        assert_eq!(a.metrics.score_team_a, b.metrics.score_team_a);
        assert_eq!(a.metrics.score_team_b, b.metrics.score_team_b);
    }

    #[test]
    fn test_recorded_run_captures_frames() {
        let (result, export) = runner(5).with_duration(5.0).run_recorded(ScenarioId::SteadyPlay, 10);
        assert_eq!(export.passed, result.passed);
        assert!(export.frames.len() >= 10);
        assert!(export.frames.iter().all(|f| f.peers.len() == 4));
    }
}
