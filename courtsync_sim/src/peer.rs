//! SimPeer - A SessionPeer driven by a bot script.
//!
//! Bridges `courtsync_core::SessionPeer` with the simulation harness:
//! - Bot input for the peer's own actor, decided from the peer's own view
//! - One frame of the session per step
//! - Access to stats for the runner and the exporter

use crate::context::SimContext;
use crate::script::{BotScript, SeededShotResolver};
use crate::store::SimStore;

use courtsync_core::{PeerConfig, SessionError, SessionPeer, TickReport};
use courtsync_env::PeerId;
use std::sync::Arc;

/// A simulated peer.
pub struct SimPeer {
    inner: SessionPeer<SimContext, SimStore>,
    script: BotScript,
    /// Join order, used for seed derivation
    index: usize,
}

impl SimPeer {
    /// Creates a peer whose bot and shot outcomes are seeded from `seed`.
    pub fn new(
        context: Arc<SimContext>,
        store: Arc<SimStore>,
        config: PeerConfig,
        index: usize,
        seed: u64,
        input_noise_std: f64,
    ) -> Self {
        let resolver = SeededShotResolver::new(seed ^ 0x5107);
        let inner = SessionPeer::new(context, store, config, Box::new(resolver));
        Self {
            inner,
            script: BotScript::new(seed, input_noise_std),
            index,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn join(&mut self) -> Result<(), SessionError> {
        self.inner.join().await
    }

    /// Decides the bot's input, then runs one frame.
    pub async fn step(&mut self) -> TickReport {
        if let Some(actor) = self.inner.local_actor() {
            let command = self
                .script
                .decide(self.inner.state().state(), actor, &self.inner.config.sync);
            self.inner.queue_input(command);
        }
        self.inner.tick().await
    }

    /// Runs one frame with no new input; held intent stays.
    pub async fn idle_step(&mut self) -> TickReport {
        self.inner.queue_input(courtsync_core::InputCommand::idle());
        self.inner.tick().await
    }

    pub fn inner(&self) -> &SessionPeer<SimContext, SimStore> {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SessionPeer<SimContext, SimStore> {
        &mut self.inner
    }
}
