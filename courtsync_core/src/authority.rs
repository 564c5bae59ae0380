//! Authority Layer - the coordinator's broadcast side.
//!
//! The coordinator runs the full simulation and, every
//! `state_update_interval` frames, writes an [`AuthoritySnapshot`] with the
//! live animation hints to `game.<sid>.state`. The [`NetworkMonitor`]
//! classifies the store link so cadence and tolerances can follow measured
//! quality.

use crate::actor::ControlMap;
use crate::config::{HintConfig, NetworkQuality, ReconciliationConfig, SyncConfig};
use crate::error::SessionError;
use crate::hints::{AnimationHint, HintOutbox};
use crate::state::SessionState;
use crate::wire::{encode, AuthoritySnapshot, SessionKeys};
use courtsync_env::{Durability, PeerId, SharedStore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Role a peer currently plays in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Coordinator,
    Follower,
}

impl PeerRole {
    pub fn is_coordinator(&self) -> bool {
        *self == PeerRole::Coordinator
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Coordinator => write!(f, "coordinator"),
            PeerRole::Follower => write!(f, "follower"),
        }
    }
}

/// Share of turbo drain a peer debits locally.
///
/// The coordinator's state is authoritative, so it always drains at full
/// rate. A follower drains at the configured predictive factor, or at the
/// catch-up factor while recovering from a hard correction.
pub fn predictive_turbo_drain_factor(
    role: PeerRole,
    catchup_frames: u32,
    config: &ReconciliationConfig,
) -> f64 {
    match role {
        PeerRole::Coordinator => 1.0,
        PeerRole::Follower if catchup_frames > 0 => config.catchup_drain_factor,
        PeerRole::Follower => config.predictive_drain_factor,
    }
}

// ============================================================================
// BROADCAST
// ============================================================================

/// Snapshot cadence, hint outbox and publishing for the coordinator.
#[derive(Debug, Clone)]
pub struct Authority {
    interval: u32,
    frames_since_broadcast: u32,
    hints: HintConfig,
    outbox: HintOutbox,
    broadcasts: u64,
}

impl Authority {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            interval: config.state_update_interval.max(1),
            frames_since_broadcast: 0,
            hints: config.hints.clone(),
            outbox: HintOutbox::new(),
            broadcasts: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval.max(1);
    }

    pub fn set_hint_config(&mut self, hints: HintConfig) {
        self.hints = hints;
    }

    pub fn hint_ttl(&self) -> u32 {
        self.hints.ttl_frames
    }

    /// Queues a hint for the next broadcasts.
    pub fn push_hint(&mut self, hint: AnimationHint) {
        self.outbox.push(hint);
    }

    pub fn live_hints(&self) -> usize {
        self.outbox.len()
    }

    pub fn broadcasts(&self) -> u64 {
        self.broadcasts
    }

    /// Advances one frame; true when a broadcast is due on this frame.
    pub fn frame_due(&mut self) -> bool {
        self.outbox.tick();
        self.frames_since_broadcast += 1;
        if self.frames_since_broadcast >= self.interval {
            self.frames_since_broadcast = 0;
            true
        } else {
            false
        }
    }

    /// Forces the next frame to broadcast (after a role switch).
    pub fn broadcast_next_frame(&mut self) {
        self.frames_since_broadcast = self.interval;
    }

    pub fn build_snapshot(
        &self,
        frame: u64,
        coordinator: PeerId,
        epoch: u64,
        state: &SessionState,
        control: &ControlMap,
    ) -> AuthoritySnapshot {
        AuthoritySnapshot {
            frame,
            coordinator,
            epoch,
            state: state.clone(),
            control: control.clone(),
            hints: self.outbox.packet(self.hints.max_per_packet),
        }
    }

    /// Writes `snapshot` to the session's state key.
    pub async fn publish<S: SharedStore>(
        &mut self,
        store: &S,
        keys: &SessionKeys,
        snapshot: &AuthoritySnapshot,
    ) -> Result<(), SessionError> {
        let payload = encode(snapshot)?;
        store
            .write(keys.scope(), &keys.state(), payload, Durability::Ephemeral)
            .await?;
        self.broadcasts += 1;
        debug!("broadcast snapshot frame {} ({} hints)", snapshot.frame, snapshot.hints.len());
        Ok(())
    }
}

// ============================================================================
// NETWORK QUALITY
// ============================================================================

/// Rolling view of store read health.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    window: usize,
    /// true = read answered, false = dropped/timed out
    outcomes: VecDeque<bool>,
    latencies_ms: VecDeque<f64>,
    quality: NetworkQuality,
}

impl NetworkMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: VecDeque::new(),
            latencies_ms: VecDeque::new(),
            quality: NetworkQuality::Good,
        }
    }

    pub fn quality(&self) -> NetworkQuality {
        self.quality
    }

    /// A read was answered.
    pub fn record_answer(&mut self) {
        self.push_outcome(true);
    }

    /// A fresh value was observed `latency_ms` after it was written.
    pub fn record_latency(&mut self, latency_ms: f64) {
        if self.latencies_ms.len() >= self.window {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms.max(0.0));
    }

    /// A read was dropped or timed out.
    pub fn record_drop(&mut self) {
        self.push_outcome(false);
    }

    fn push_outcome(&mut self, ok: bool) {
        if self.outcomes.len() >= self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn mean_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    pub fn loss_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let dropped = self.outcomes.iter().filter(|ok| !**ok).count();
        dropped as f64 / self.outcomes.len() as f64
    }

    /// Re-classifies once the window is full.
    ///
    /// Returns the new quality when it changed.
    pub fn reclassify(&mut self) -> Option<NetworkQuality> {
        if self.outcomes.len() < self.window {
            return None;
        }
        let measured = NetworkQuality::classify(self.mean_latency_ms(), self.loss_rate());
        if measured == self.quality {
            return None;
        }
        info!(
            "network quality {} -> {} (latency {:.0}ms, loss {:.1}%)",
            self.quality,
            measured,
            self.mean_latency_ms(),
            self.loss_rate() * 100.0
        );
        self.quality = measured;
        Some(measured)
    }
}
