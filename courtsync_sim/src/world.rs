//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::peer::SimPeer;
use crate::store::{SimStore, SimStoreController};

use courtsync_core::authority::PeerRole;
use courtsync_core::election::leave_session;
use courtsync_core::wire::SessionKeys;
use courtsync_core::{PeerConfig, SessionError, SyncConfig, TickReport};
use courtsync_env::{PeerId, SessionId, SyncContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Peer ids are `p1`..`p9`; lexicographic order is spawn order.
pub const MAX_PEERS: usize = 9;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Too many peers: {0} (max {MAX_PEERS})")]
    TooManyPeers(usize),

    #[error("Peer already joined: {0}")]
    AlreadyJoined(PeerId),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn
    pub num_peers: usize,

    /// Actors per team
    pub per_team: u32,

    /// Core tunables shared by every peer
    pub sync: SyncConfig,

    /// Stick noise standard deviation for bot input
    pub input_noise_std: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 4,
            per_team: 2,
            sync: SyncConfig::default(),
            input_noise_std: 0.15,
        }
    }
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Store fault injection
    pub controller: SimStoreController,

    /// Session-service handle on the store, used to drop crashed peers
    root_store: SimStore,

    keys: SessionKeys,

    peers: BTreeMap<PeerId, SimPeer>,

    crashed: Vec<PeerId>,

    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = Arc::new(SimContext::new(config.seed));
        let store_seed = context.derive_seed(0x5707e);
        let root_store = SimStore::new(PeerId::new("admin"), Arc::clone(&context), store_seed);
        let controller = root_store.controller();
        let keys = SessionKeys::new(SessionId::from_seed(config.seed));

        Self {
            config,
            context,
            controller,
            root_store,
            keys,
            peers: BTreeMap::new(),
            crashed: Vec::new(),
            tick_count: 0,
        }
    }

    /// Spawns and joins every peer, in order. The first one coordinates.
    pub async fn spawn_peers(&mut self) -> Result<Vec<PeerId>, SimError> {
        self.spawn_peers_except(&[]).await
    }

    /// Spawns every peer except the `held_back` indices, which can join
    /// later through [`join_peer`](Self::join_peer).
    pub async fn spawn_peers_except(&mut self, held_back: &[usize]) -> Result<Vec<PeerId>, SimError> {
        if self.config.num_peers > MAX_PEERS {
            return Err(SimError::TooManyPeers(self.config.num_peers));
        }

        let mut ids = Vec::new();
        for index in (0..self.config.num_peers).filter(|i| !held_back.contains(i)) {
            ids.push(self.join_peer(index).await?);
        }

        info!("Spawned {} peers in session {}", ids.len(), self.keys.session());
        Ok(ids)
    }

    /// Creates peer `index` and joins it to the running session.
    pub async fn join_peer(&mut self, index: usize) -> Result<PeerId, SimError> {
        if index >= MAX_PEERS {
            return Err(SimError::TooManyPeers(index + 1));
        }
        let peer_id = PeerId::from_index(index);
        if self.peers.contains_key(&peer_id) {
            return Err(SimError::AlreadyJoined(peer_id));
        }

        let store = Arc::new(self.root_store.handle(peer_id.clone()));
        let config = PeerConfig {
            name: peer_id.to_string(),
            session: self.keys.session(),
            per_team: self.config.per_team,
            sync: self.config.sync.clone(),
        };
        let seed = self.context.derive_seed(index as u64 + 1);

        let mut peer = SimPeer::new(
            Arc::clone(&self.context),
            store,
            config,
            index,
            seed,
            self.config.input_noise_std,
        );
        peer.join().await?;
        if self.tick_count > 0 {
            debug!("{} joined at tick {}", peer_id, self.tick_count);
        }
        self.peers.insert(peer_id.clone(), peer);
        Ok(peer_id)
    }

    /// Runs one frame on every live peer, then advances virtual time.
    pub async fn step(&mut self) -> Vec<(PeerId, TickReport)> {
        let mut reports = Vec::with_capacity(self.peers.len());
        for (id, peer) in self.peers.iter_mut() {
            reports.push((id.clone(), peer.step().await));
        }
        self.finish_frame();
        reports
    }

    /// Like [`step`](Self::step) but bots stand still.
    pub async fn idle_step(&mut self) -> Vec<(PeerId, TickReport)> {
        let mut reports = Vec::with_capacity(self.peers.len());
        for (id, peer) in self.peers.iter_mut() {
            reports.push((id.clone(), peer.idle_step().await));
        }
        self.finish_frame();
        reports
    }

    fn finish_frame(&mut self) {
        let frame = Duration::from_millis(self.config.sync.frame_delay_ms);
        self.context.advance_time(frame);
        self.tick_count += 1;
    }

    /// Kills a peer without a goodbye. The session service notices the
    /// dropped connection and removes it from the player list.
    pub async fn crash_peer(&mut self, id: &PeerId) -> Result<(), SimError> {
        if self.peers.remove(id).is_none() {
            return Err(SimError::UnknownPeer(id.clone()));
        }
        leave_session(&self.root_store, &self.keys, id).await?;
        self.crashed.push(id.clone());
        debug!("Crashed {} at tick {}", id, self.tick_count);
        Ok(())
    }

    /// Peers that currently believe they coordinate.
    pub fn coordinators(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.inner().role() == PeerRole::Coordinator)
            .map(|p| p.peer_id().clone())
            .collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&SimPeer> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &PeerId) -> Option<&mut SimPeer> {
        self.peers.get_mut(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers.values()
    }

    pub fn crashed(&self) -> &[PeerId] {
        &self.crashed
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of live peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
