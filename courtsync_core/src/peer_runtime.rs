//! Peer Runtime - Orchestrates the session engines with environment context.
//!
//! This module is the integration layer between the pure engines (state,
//! game flow, prediction, election) and the environment abstraction
//! (`SyncContext` + `SharedStore`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SessionPeer                           │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │   Context: SyncContext       Store: SharedStore       │   │
//! │  │  • now() → latency samples  • game.<sid>.state        │   │
//! │  │  • sleep() → frame pacing   • game.<sid>.coordinator  │   │
//! │  │                             • game.<sid>.inputs.<pid> │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                               │
//! │  ┌──────────┐ ┌───────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │   FLOW   │ │ AUTHORITY │ │ PREDICTION │ │  FAILOVER  │   │
//! │  │(coord.)  │ │ (coord.)  │ │ (follower) │ │ (everyone) │   │
//! │  └──────────┘ └───────────┘ └────────────┘ └────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! One `tick` is one frame. A coordinator reads follower inputs, runs the
//! game flow and broadcasts every `state_update_interval` frames. A follower
//! predicts its own actor, writes its input and reconciles against the
//! latest snapshot. Every peer runs the health check every
//! `health_check_interval` frames and switches role when the record says so.
//!
//! # Usage
//!
//! ```ignore
//! use courtsync_core::peer_runtime::{SessionPeer, PeerConfig};
//! use courtsync_core::flow::FixedShotResolver;
//! use courtsync_env::{MemoryStore, PeerId, TokioContext};
//!
//! let store = Arc::new(MemoryStore::new(PeerId::new("p1")));
//! let mut peer = SessionPeer::new(TokioContext::shared(), store, PeerConfig::default(),
//!     Box::new(FixedShotResolver::makes()));
//! peer.join().await?;
//! peer.run(600).await?;
//! ```

use crate::actor::{ActorId, ControlMap, InputAction, InputCommand, Roster};
use crate::authority::{Authority, NetworkMonitor, PeerRole};
use crate::config::{NetworkQuality, SyncConfig};
use crate::election::{join_session, leave_session, read_record, FailoverMonitor, FailoverOutcome, Seat};
use crate::error::SessionError;
use crate::events::{EventBus, GameEvent, PossessionReason};
use crate::flow::{accepts_movement, FrameInputs, GameFlow, ShotResolver};
use crate::hints::AnimationHint;
use crate::prediction::{PredictionClient, ReconcileOutcome, SnapshotStamp};
use crate::state::{SessionState, StateContainer, StateError};
use crate::wire::{decode, encode, AuthoritySnapshot, InputPacket, SessionKeys};
use courtsync_env::{
    Durability, EnvError, LockMode, PeerId, SessionId, SharedStore, StoredValue, SyncContext,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a session peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's logical name (its `PeerId`)
    pub name: String,

    /// Session to join
    pub session: SessionId,

    /// Actors per team in a fresh session (default: 2)
    pub per_team: u32,

    /// Core tunables
    pub sync: SyncConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "p1".to_string(),
            session: SessionId::from_seed(0),
            per_team: 2,
            sync: SyncConfig::default(),
        }
    }
}

/// Running counters for one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerStats {
    pub snapshots_applied: u64,
    pub stale_snapshots: u64,
    pub reads_dropped: u64,
    pub inputs_applied: u64,
    pub publish_failures: u64,
    pub role_changes: u64,
    pub hints_fired: u64,
}

/// What happened during one `tick`.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub frame: u64,
    /// Role after the tick
    pub role: Option<PeerRole>,
    pub failover: Option<FailoverOutcome>,
    pub reconcile: Option<ReconcileOutcome>,
    /// Hints that fired locally this frame
    pub hints: Vec<AnimationHint>,
    pub quality_change: Option<NetworkQuality>,
    pub abandoned: bool,
}

/// A session participant.
///
/// Generic over the context and store implementations, so the same peer
/// code runs in production (tokio + a real store) or simulation.
pub struct SessionPeer<Ctx, St>
where
    Ctx: SyncContext,
    St: SharedStore,
{
    /// Peer identifier
    pub peer_id: PeerId,

    /// Environment context
    pub context: Arc<Ctx>,

    /// Shared store handle (writes as `peer_id`)
    pub store: Arc<St>,

    /// Configuration (`sync` is re-tuned as network quality changes)
    pub config: PeerConfig,

    keys: SessionKeys,
    role: PeerRole,
    epoch: u64,
    coordinator: Option<PeerId>,
    players: Vec<PeerId>,
    seats: Vec<Seat>,

    state: StateContainer,
    events: EventBus,
    control: ControlMap,
    local_actor: Option<ActorId>,

    flow: GameFlow,
    authority: Authority,
    prediction: PredictionClient,
    monitor: NetworkMonitor,
    failover: FailoverMonitor,

    // === Local input ===
    held_input: InputCommand,
    pending_actions: VecDeque<InputAction>,
    input_seq: u64,

    // === Coordinator input view ===
    held_remote: BTreeMap<ActorId, InputCommand>,
    last_seq: BTreeMap<PeerId, u64>,

    last_snapshot_version: Option<u64>,
    started: bool,
    abandoned: bool,
    stats: PeerStats,

    /// Current tick number
    tick_count: u64,
}

impl<Ctx, St> SessionPeer<Ctx, St>
where
    Ctx: SyncContext,
    St: SharedStore,
{
    /// Creates a peer; call [`join`](Self::join) before ticking.
    pub fn new(context: Arc<Ctx>, store: Arc<St>, config: PeerConfig, resolver: Box<dyn ShotResolver>) -> Self {
        let sync = &config.sync;
        let roster = Roster::two_teams(config.per_team, &sync.court, sync.movement.max_turbo);
        let state = StateContainer::new(SessionState::new(roster, sync));

        Self {
            peer_id: store.local_id(),
            keys: SessionKeys::new(config.session),
            role: PeerRole::Follower,
            epoch: 0,
            coordinator: None,
            players: Vec::new(),
            seats: Vec::new(),
            state,
            events: EventBus::new(),
            control: ControlMap::new(),
            local_actor: None,
            flow: GameFlow::new(sync, resolver),
            authority: Authority::new(sync),
            prediction: PredictionClient::new(sync.reconciliation.clone()),
            monitor: NetworkMonitor::new(sync.quality_window),
            failover: FailoverMonitor::new(store.local_id()),
            held_input: InputCommand::idle(),
            pending_actions: VecDeque::new(),
            input_seq: 0,
            held_remote: BTreeMap::new(),
            last_seq: BTreeMap::new(),
            last_snapshot_version: None,
            started: false,
            abandoned: false,
            stats: PeerStats::default(),
            context,
            store,
            config,
            tick_count: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn coordinator(&self) -> Option<&PeerId> {
        self.coordinator.as_ref()
    }

    pub fn state(&self) -> &StateContainer {
        &self.state
    }

    /// Direct state access for tooling and fault injection.
    pub fn state_mut(&mut self) -> &mut StateContainer {
        &mut self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Lets callers register event handlers.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn control(&self) -> &ControlMap {
        &self.control
    }

    pub fn local_actor(&self) -> Option<ActorId> {
        self.local_actor
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn quality(&self) -> NetworkQuality {
        self.monitor.quality()
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn prediction(&self) -> &PredictionClient {
        &self.prediction
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn flow(&self) -> &GameFlow {
        &self.flow
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Joins the session. The first peer in becomes coordinator and opens
    /// the game; later peers follow. Each peer drives the actor of the seat
    /// the record gives it.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        let actors = self.state.state().roster.len() as u32;
        let record = join_session(self.store.as_ref(), &self.keys, &self.peer_id, actors).await?;

        self.local_actor = record
            .actor_of(&self.peer_id)
            .filter(|id| self.state.state().roster.contains(*id));
        if let Some(actor) = self.local_actor {
            self.control.assign(actor, self.peer_id.clone());
        }

        self.epoch = record.epoch;
        self.coordinator = record.coordinator_id.clone();
        self.players = record.player_list;
        self.seats = record.seats;

        if record.coordinator_id.as_ref() == Some(&self.peer_id) {
            self.role = PeerRole::Coordinator;
            self.flow.start(&mut self.state, &mut self.events);
            self.started = true;
            self.authority.broadcast_next_frame();
        }

        info!(
            "{} joined session {} as {} (actor {:?}, epoch {})",
            self.peer_id,
            self.keys.session(),
            self.role,
            self.local_actor,
            self.epoch
        );
        Ok(())
    }

    /// Leaves the session; a departing coordinator is replaced by the next
    /// health check of the remaining peers.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        leave_session(self.store.as_ref(), &self.keys, &self.peer_id).await?;
        info!("{} left session {}", self.peer_id, self.keys.session());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// Queues local intent. Movement and turbo are held until replaced;
    /// pass, steal and shoot fire once.
    pub fn queue_input(&mut self, command: InputCommand) {
        if command.action.is_one_shot() {
            self.pending_actions.push_back(command.action);
            self.held_input = InputCommand {
                direction: command.direction,
                action: InputAction::None,
            };
        } else {
            self.held_input = command;
        }
    }

    // ------------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------------

    /// Runs `frames` ticks, sleeping one frame between them. Stops with
    /// [`SessionError::Abandoned`] once no coordinator can be elected.
    pub async fn run(&mut self, frames: u64) -> Result<(), SessionError> {
        let frame = Duration::from_millis(self.config.sync.frame_delay_ms);
        for _ in 0..frames {
            let report = self.tick().await;
            if report.abandoned {
                return Err(SessionError::Abandoned(self.keys.session()));
            }
            self.context.sleep(frame).await;
        }
        Ok(())
    }

    /// Advances the peer by one frame.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_count += 1;
        let frame = self.tick_count;
        let mut report = TickReport {
            frame,
            ..TickReport::default()
        };

        if self.abandoned {
            report.abandoned = true;
            return report;
        }

        let interval = self.config.sync.health_check_interval.max(1) as u64;
        if frame % interval == 0 {
            report.failover = self.health_check().await;
        }
        if self.abandoned {
            report.abandoned = true;
            report.role = Some(self.role);
            return report;
        }

        match self.role {
            PeerRole::Coordinator => self.coordinator_tick(frame, &mut report).await,
            PeerRole::Follower => self.follower_tick(frame, &mut report).await,
        }

        if let Some(quality) = self.monitor.reclassify() {
            if self.config.sync.adaptive_tuning {
                self.apply_quality(quality);
            }
            report.quality_change = Some(quality);
        }

        report.role = Some(self.role);
        report
    }

    async fn coordinator_tick(&mut self, frame: u64, report: &mut TickReport) {
        if !self.started {
            self.flow.start(&mut self.state, &mut self.events);
            self.started = true;
        }

        let mut inputs = self.collect_remote_inputs().await;
        if let Some(actor) = self.local_actor {
            self.held_remote.insert(actor, self.held_input);
            if let Some(action) = self.pending_actions.pop_front() {
                inputs.act(actor, action);
            }
        }
        for (actor, command) in &self.held_remote {
            inputs.hold(*actor, *command);
        }

        let frame_report = self.flow.update(&mut self.state, &mut self.events, &inputs, frame);
        for hint in frame_report.hints {
            report.hints.push(hint.clone());
            self.authority.push_hint(hint);
        }

        if self.authority.frame_due() {
            let snapshot = self.authority.build_snapshot(
                frame,
                self.peer_id.clone(),
                self.epoch,
                self.state.state(),
                &self.control,
            );
            if let Err(e) = self
                .authority
                .publish(self.store.as_ref(), &self.keys, &snapshot)
                .await
            {
                self.stats.publish_failures += 1;
                if e.is_transient() {
                    debug!("{} snapshot publish dropped: {}", self.peer_id, e);
                } else {
                    warn!("{} snapshot publish failed: {}", self.peer_id, e);
                }
            }
        }
    }

    /// Reads every follower's latest packet. New sequence numbers replace
    /// held intent; one-shot actions fire once.
    async fn collect_remote_inputs(&mut self) -> FrameInputs {
        let mut inputs = FrameInputs::new();
        let peers: Vec<PeerId> = self
            .players
            .iter()
            .filter(|p| **p != self.peer_id)
            .cloned()
            .collect();

        for peer in peers {
            let key = self.keys.inputs(&peer);
            let value = match self.timed_read(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    debug!("{} input read for {} failed: {}", self.peer_id, peer, e);
                    continue;
                }
            };

            let packet: InputPacket = match decode(&value.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("{} dropped malformed input from {}: {}", self.peer_id, peer, e);
                    continue;
                }
            };
            if packet.peer != peer || self.last_seq.get(&peer).is_some_and(|seq| packet.seq <= *seq) {
                continue;
            }
            if !self.seats.iter().any(|seat| seat.peer == peer && seat.actor == packet.actor) {
                debug!("{} ignored input from {} for unseated {}", self.peer_id, peer, packet.actor);
                continue;
            }
            self.last_seq.insert(peer.clone(), packet.seq);
            self.record_latency(&value);

            let held = if packet.command.action.is_one_shot() {
                inputs.act(packet.actor, packet.command.action);
                InputCommand {
                    direction: packet.command.direction,
                    action: InputAction::None,
                }
            } else {
                packet.command
            };
            self.held_remote.insert(packet.actor, held);
            self.control.assign(packet.actor, peer);
            self.stats.inputs_applied += 1;
        }
        inputs
    }

    async fn follower_tick(&mut self, frame: u64, report: &mut TickReport) {
        self.state.set_frame(frame);
        self.predict_local();
        self.send_input(frame).await;

        let key = self.keys.state();
        match self.timed_read(&key).await {
            Ok(Some(value)) => self.apply_snapshot_value(value, report),
            Ok(None) => {}
            Err(e) => debug!("{} snapshot read failed: {}", self.peer_id, e),
        }

        self.prediction.tick();
    }

    fn predict_local(&mut self) {
        let Some(actor) = self.local_actor else {
            return;
        };
        if !accepts_movement(self.state.state().phase.current) {
            return;
        }

        let sync = &self.config.sync;
        let (prediction, command) = (&self.prediction, self.held_input);
        let result = self.state.mutate(
            |s| -> Result<(), StateError> {
                let local = s.roster.get_mut(actor).ok_or(StateError::UnknownActor(actor))?;
                prediction.apply_local_input(local, &command, &sync.movement, &sync.court, sync.frame_secs());
                Ok(())
            },
            "predict",
        );
        if let Err(e) = result {
            debug!("{} prediction skipped: {}", self.peer_id, e);
        }
    }

    async fn send_input(&mut self, frame: u64) {
        let Some(actor) = self.local_actor else {
            return;
        };
        let action = self.pending_actions.pop_front();
        self.input_seq += 1;
        let packet = InputPacket {
            peer: self.peer_id.clone(),
            actor,
            seq: self.input_seq,
            frame,
            command: InputCommand {
                direction: self.held_input.direction,
                action: action.unwrap_or(self.held_input.action),
            },
        };

        let payload = match encode(&packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} could not encode input: {}", self.peer_id, e);
                return;
            }
        };
        let key = self.keys.inputs(&self.peer_id);
        if let Err(e) = self
            .store
            .write(self.keys.scope(), &key, payload, Durability::Ephemeral)
            .await
        {
            debug!("{} input write dropped: {}", self.peer_id, e);
        }
    }

    fn apply_snapshot_value(&mut self, value: StoredValue, report: &mut TickReport) {
        if self.last_snapshot_version.is_some_and(|v| value.version <= v) {
            return;
        }
        self.last_snapshot_version = Some(value.version);
        self.record_latency(&value);

        let snapshot: AuthoritySnapshot = match decode(&value.payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("{} dropped malformed snapshot: {}", self.peer_id, e);
                return;
            }
        };
        if snapshot.epoch < self.epoch {
            self.stats.stale_snapshots += 1;
            debug!(
                "{} ignored snapshot from epoch {} (current {})",
                self.peer_id, snapshot.epoch, self.epoch
            );
            return;
        }
        self.apply_snapshot(snapshot, report);
    }

    /// Adopts the authoritative state, keeping the local actor on its
    /// reconciled prediction.
    fn apply_snapshot(&mut self, snapshot: AuthoritySnapshot, report: &mut TickReport) {
        let mut incoming = snapshot.state;

        if let Some(actor) = self.local_actor {
            let local = self.state.state().roster.get(actor).cloned();
            let authoritative = incoming.roster.get(actor).cloned();
            if let (Some(mut local), Some(authoritative)) = (local, authoritative) {
                let outcome = self.prediction.reconcile(
                    &mut local,
                    &authoritative,
                    SnapshotStamp::new(snapshot.epoch, snapshot.frame),
                    incoming.phase.current,
                );
                if outcome == ReconcileOutcome::Skipped {
                    self.stats.stale_snapshots += 1;
                    return;
                }
                incoming.roster.insert(local);
                report.reconcile = Some(outcome);
            }
        }

        let old_team = self.state.state().current_team;
        let (new_team, carrier) = (incoming.current_team, incoming.ball_carrier);
        let result = self.state.mutate(
            |s| -> Result<(), StateError> {
                *s = incoming;
                Ok(())
            },
            "authority_snapshot",
        );
        if let Err(e) = result {
            warn!("{} could not apply snapshot: {}", self.peer_id, e);
            return;
        }

        if old_team != new_team {
            self.events.emit(GameEvent::PossessionChange {
                old_team,
                new_team,
                reason: PossessionReason::Replicated,
                carrier,
            });
        }

        let fired = self.prediction.receive_hints(&snapshot.hints);
        self.stats.hints_fired += fired.len() as u64;
        report.hints.extend(fired);

        self.control = snapshot.control;
        if let Some(actor) = self.local_actor {
            self.control.assign(actor, self.peer_id.clone());
        }
        if self.coordinator.as_ref() != Some(&snapshot.coordinator) {
            self.coordinator = Some(snapshot.coordinator);
        }
        self.epoch = self.epoch.max(snapshot.epoch);
        self.stats.snapshots_applied += 1;
    }

    // ------------------------------------------------------------------------
    // Health and tuning
    // ------------------------------------------------------------------------

    async fn health_check(&mut self) -> Option<FailoverOutcome> {
        let outcome = match self
            .failover
            .check(self.store.as_ref(), &self.keys, &mut self.events)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    debug!("{} health check skipped: {}", self.peer_id, e);
                } else {
                    warn!("{} health check failed: {}", self.peer_id, e);
                }
                return None;
            }
        };

        match &outcome {
            FailoverOutcome::Healthy { coordinator, epoch } => {
                self.epoch = self.epoch.max(*epoch);
                let is_local = *coordinator == self.peer_id;
                self.coordinator = Some(coordinator.clone());
                match (is_local, self.role) {
                    (true, PeerRole::Follower) => self.become_coordinator(*epoch),
                    (false, PeerRole::Coordinator) => self.become_follower(coordinator.clone()),
                    _ => {}
                }
            }
            FailoverOutcome::Promoted { epoch } => self.become_coordinator(*epoch),
            FailoverOutcome::Abandoned => {
                warn!("{} abandoning session {}", self.peer_id, self.keys.session());
                self.abandoned = true;
            }
            FailoverOutcome::AwaitingPromotion { .. } | FailoverOutcome::Contended | FailoverOutcome::NoRecord => {}
        }

        if self.role.is_coordinator() {
            self.refresh_players().await;
        }
        Some(outcome)
    }

    /// Re-reads the player list and seats. Departed peers release their
    /// actors; a seat handed to a new peer drops the old held intent.
    async fn refresh_players(&mut self) {
        let record = match read_record(self.store.as_ref(), &self.keys).await {
            Ok(Some((record, _))) => record,
            Ok(None) => return,
            Err(e) => {
                debug!("{} player refresh skipped: {}", self.peer_id, e);
                return;
            }
        };

        for departed in self.players.iter().filter(|p| !record.contains(p)) {
            for actor in self.control.release_peer(departed) {
                self.held_remote.remove(&actor);
                info!("{} released {} from departed {}", self.peer_id, actor, departed);
            }
            self.last_seq.remove(departed);
        }
        for seat in &record.seats {
            if self.control.controller_of(seat.actor) != Some(&seat.peer) {
                self.held_remote.remove(&seat.actor);
                self.control.assign(seat.actor, seat.peer.clone());
            }
        }
        self.players = record.player_list;
        self.seats = record.seats;
    }

    fn become_coordinator(&mut self, epoch: u64) {
        info!(
            "{} takes over as coordinator at frame {} (epoch {})",
            self.peer_id, self.tick_count, epoch
        );
        self.role = PeerRole::Coordinator;
        self.epoch = epoch;
        self.coordinator = Some(self.peer_id.clone());
        self.started = true;
        self.prediction.reset();
        self.held_remote.clear();
        self.last_seq.clear();
        self.authority.broadcast_next_frame();
        self.stats.role_changes += 1;
    }

    fn become_follower(&mut self, coordinator: PeerId) {
        info!("{} steps down; {} coordinates", self.peer_id, coordinator);
        self.role = PeerRole::Follower;
        self.prediction.reset();
        self.last_snapshot_version = None;
        self.stats.role_changes += 1;
    }

    /// Applies the preset for `quality` to the live tunables.
    pub fn apply_quality(&mut self, quality: NetworkQuality) {
        self.config.sync.apply_quality(quality);
        let sync = &self.config.sync;
        self.authority.set_interval(sync.state_update_interval);
        self.authority.set_hint_config(sync.hints.clone());
        self.prediction
            .set_drift_snap_threshold(sync.reconciliation.drift_snap_threshold);
        info!(
            "{} tuned for {} network (interval {}, drift {:.1})",
            self.peer_id, quality, sync.state_update_interval, sync.reconciliation.drift_snap_threshold
        );
    }

    // ------------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------------

    /// Reads `key`, bounded by `read_timeout_ms`. Feeds the network monitor.
    async fn timed_read(&mut self, key: &str) -> Result<Option<StoredValue>, SessionError> {
        let limit_ms = self.config.sync.read_timeout_ms;
        let read = self.store.read(self.keys.scope(), key, LockMode::Shared);
        let result = match tokio::time::timeout(Duration::from_millis(limit_ms), read).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Store(EnvError::Timeout(limit_ms))),
        };

        match &result {
            Ok(_) => self.monitor.record_answer(),
            Err(_) => {
                self.monitor.record_drop();
                self.stats.reads_dropped += 1;
            }
        }
        result
    }

    fn record_latency(&mut self, value: &StoredValue) {
        let now_ms = self.context.now().as_millis() as u64;
        self.monitor
            .record_latency(now_ms.saturating_sub(value.written_at_ms) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::flow::FixedShotResolver;
    use crate::phase::Phase;
    use courtsync_env::{MemoryStore, TokioContext};

    type Peer = SessionPeer<TokioContext, MemoryStore>;

    fn config(name: &str) -> PeerConfig {
        let mut config = PeerConfig {
            name: name.to_string(),
            session: SessionId::from_seed(7),
            ..PeerConfig::default()
        };
        config.sync.health_check_interval = 2;
        config.sync.state_update_interval = 1;
        // Wall-clock stamps make latency meaningless here
        config.sync.adaptive_tuning = false;
        config
    }

    fn peer(root: &MemoryStore, name: &str) -> Peer {
        SessionPeer::new(
            TokioContext::shared(),
            Arc::new(root.handle(PeerId::new(name))),
            config(name),
            Box::new(FixedShotResolver::makes()),
        )
    }

    async fn tick_all(peers: &mut [&mut Peer], frames: u64) {
        for _ in 0..frames {
            for peer in peers.iter_mut() {
                peer.tick().await;
            }
        }
    }

    #[tokio::test]
    async fn test_first_peer_coordinates() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        p1.join().await.unwrap();
        p2.join().await.unwrap();

        assert_eq!(p1.role(), PeerRole::Coordinator);
        assert_eq!(p2.role(), PeerRole::Follower);
        assert_eq!(p1.local_actor(), Some(ActorId(0)));
        assert_eq!(p2.local_actor(), Some(ActorId(1)));
        assert_eq!(p1.state().state().phase.current, Phase::JumpBall);
    }

    #[tokio::test]
    async fn test_follower_tracks_snapshots() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        p1.join().await.unwrap();
        p2.join().await.unwrap();

        tick_all(&mut [&mut p1, &mut p2], 20).await;

        assert!(p2.stats().snapshots_applied > 0);
        assert_eq!(p2.coordinator(), Some(&PeerId::new("p1")));
        assert_eq!(p2.state().state().phase.current, Phase::Normal);
        assert_eq!(p2.state().state().ball_carrier, p1.state().state().ball_carrier);
    }

    #[tokio::test]
    async fn test_follower_input_reaches_coordinator() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        p1.join().await.unwrap();
        p2.join().await.unwrap();
        let start_x = p1.state().state().roster.get(ActorId(1)).unwrap().position.x;

        p2.queue_input(InputCommand::moving(1.0, 0.0));
        tick_all(&mut [&mut p1, &mut p2], 30).await;

        let moved = p1.state().state().roster.get(ActorId(1)).unwrap().position.x;
        assert!(moved > start_x + 1.0);
        assert!(p1.stats().inputs_applied > 0);
        assert_eq!(p1.control().controller_of(ActorId(1)), Some(&PeerId::new("p2")));
    }

    #[tokio::test]
    async fn test_coordinator_departure_promotes_lowest_id() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        let mut p3 = peer(&root, "p3");
        p1.join().await.unwrap();
        p2.join().await.unwrap();
        p3.join().await.unwrap();
        tick_all(&mut [&mut p1, &mut p2, &mut p3], 20).await;

        // p1 vanishes; the host drops it from the list
        leave_session(&root, p1.keys(), &PeerId::new("p1")).await.unwrap();
        tick_all(&mut [&mut p2, &mut p3], 6).await;

        assert_eq!(p2.role(), PeerRole::Coordinator);
        assert_eq!(p3.role(), PeerRole::Follower);
        assert_eq!(p2.epoch(), 2);
        assert_eq!(p3.coordinator(), Some(&PeerId::new("p2")));
        assert_eq!(p2.events().count(EventKind::CoordinatorChanged), 1);
        assert_eq!(p3.events().count(EventKind::CoordinatorChanged), 0);
    }

    #[tokio::test]
    async fn test_followers_track_late_joiner_after_failover() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p3 = peer(&root, "p3");
        p1.join().await.unwrap();
        p3.join().await.unwrap();
        tick_all(&mut [&mut p1, &mut p3], 200).await;

        // p2 arrives with its frame counter at zero and outranks p3
        let mut p2 = peer(&root, "p2");
        p2.join().await.unwrap();
        tick_all(&mut [&mut p1, &mut p2, &mut p3], 10).await;
        leave_session(&root, p1.keys(), &PeerId::new("p1")).await.unwrap();
        tick_all(&mut [&mut p2, &mut p3], 4).await;
        assert_eq!(p2.role(), PeerRole::Coordinator);
        assert!(p2.tick_count() < p3.tick_count());

        let applied = p3.stats().snapshots_applied;
        tick_all(&mut [&mut p2, &mut p3], 100).await;

        assert!(p3.stats().snapshots_applied >= applied + 90);
        assert_eq!(p3.coordinator(), Some(&PeerId::new("p2")));
        assert_eq!(p3.epoch(), p2.epoch());
        let (leader, follower) = (p2.state().state(), p3.state().state());
        assert_eq!(follower.time_remaining, leader.time_remaining);
        assert_eq!(follower.score, leader.score);
        assert_eq!(follower.phase.current, leader.phase.current);
    }

    #[tokio::test]
    async fn test_rejoin_never_shares_an_actor() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        let mut p3 = peer(&root, "p3");
        p1.join().await.unwrap();
        p2.join().await.unwrap();
        p3.join().await.unwrap();
        tick_all(&mut [&mut p1, &mut p2, &mut p3], 10).await;

        p2.leave().await.unwrap();
        let mut p4 = peer(&root, "p4");
        p4.join().await.unwrap();

        assert_eq!(p3.local_actor(), Some(ActorId(2)));
        assert_eq!(p4.local_actor(), Some(ActorId(1)));
        assert_ne!(p3.local_actor(), p4.local_actor());

        // The coordinator moves p2's seat over to p4
        p4.queue_input(InputCommand::moving(1.0, 0.0));
        tick_all(&mut [&mut p1, &mut p3, &mut p4], 10).await;
        assert_eq!(p1.control().controller_of(ActorId(1)), Some(&PeerId::new("p4")));
        assert_eq!(p1.control().controller_of(ActorId(2)), Some(&PeerId::new("p3")));
    }

    #[tokio::test]
    async fn test_empty_session_is_abandoned() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        let mut p2 = peer(&root, "p2");
        p1.join().await.unwrap();
        p2.join().await.unwrap();

        leave_session(&root, p2.keys(), &PeerId::new("p1")).await.unwrap();
        leave_session(&root, p2.keys(), &PeerId::new("p2")).await.unwrap();
        tick_all(&mut [&mut p2], 4).await;

        assert!(p2.is_abandoned());
        assert_eq!(p2.events().count(EventKind::SessionAbandoned), 1);
        assert!(p2.tick().await.abandoned);
    }

    #[tokio::test]
    async fn test_run_reports_abandonment() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        p1.join().await.unwrap();
        leave_session(&root, p1.keys(), &PeerId::new("p1")).await.unwrap();

        let session = p1.keys().session();
        match p1.run(10).await {
            Err(SessionError::Abandoned(id)) => assert_eq!(id, session),
            other => panic!("expected abandonment, got {:?}", other),
        }
        assert!(p1.tick_count() <= 2);
    }

    #[tokio::test]
    async fn test_one_shot_actions_are_not_held() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        p1.join().await.unwrap();

        p1.queue_input(InputCommand::moving(0.0, 1.0).with_action(InputAction::Shoot));
        assert_eq!(p1.held_input.action, InputAction::None);
        assert_eq!(p1.pending_actions.len(), 1);

        p1.queue_input(InputCommand::idle().with_action(InputAction::Turbo));
        assert_eq!(p1.held_input.action, InputAction::Turbo);
    }

    #[tokio::test]
    async fn test_quality_preset_retunes_cadence() {
        let root = MemoryStore::new(PeerId::new("admin"));
        let mut p1 = peer(&root, "p1");
        p1.join().await.unwrap();

        p1.apply_quality(NetworkQuality::Poor);
        assert_eq!(p1.authority().interval(), 6);
        assert_eq!(p1.config.sync.hints.ttl_frames, 24);
    }
}
