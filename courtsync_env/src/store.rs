//! Shared key-value store abstraction between CourtSync peers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Durability, LockMode, PeerId, StoreScope, StoredValue};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Abstraction for the last-write-wins store peers synchronize through.
///
/// # Implementations
///
/// - **Production**: `MemoryStore` (in-process) or an adapter over a real KV service
/// - **Simulation**: `SimStore` with configurable latency/loss/isolation
///
/// # Value Flow
///
/// ```text
/// Coordinator                 Store                     Follower
///   |                           |                          |
///   |-- write(state) ---------->|                          |
///   |                           |<------ read(state) ------|
///   |                           |-- [latency/staleness] -->|
/// ```
///
/// Writes are fire-and-forget: `Ok(())` means queued, not delivered.
/// Reads may return stale values or `None`; callers treat both as
/// "no new information".
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Writes `value` under `scope`/`key`, replacing any previous value.
    async fn write(
        &self,
        scope: &StoreScope,
        key: &str,
        value: Vec<u8>,
        durability: Durability,
    ) -> Result<(), EnvError>;
    
    /// Reads the latest visible value for `scope`/`key`.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - A value was visible
    /// * `Ok(None)` - No value (never written, removed, or dropped read)
    async fn read(
        &self,
        scope: &StoreScope,
        key: &str,
        lock: LockMode,
    ) -> Result<Option<StoredValue>, EnvError>;
    
    /// Subscribes to every future write of `scope`/`key`.
    async fn subscribe(&self, scope: &StoreScope, key: &str) -> Result<Subscription, EnvError>;
    
    /// Removes the value for `scope`/`key`.
    async fn remove(&self, scope: &StoreScope, key: &str) -> Result<(), EnvError>;
    
    /// Writes `value` only if the current version equals `expected_version`
    /// (`None` = key must be absent).
    ///
    /// # Returns
    /// * `Ok(true)` - The write won
    /// * `Ok(false)` - Another writer got there first
    async fn compare_and_swap(
        &self,
        scope: &StoreScope,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<bool, EnvError>;
    
    /// Returns the peer this store handle writes as.
    fn local_id(&self) -> PeerId;
}

/// Stream of values written to one key.
///
/// Lagging subscribers skip straight to newer values; only the latest
/// value of a key matters under last-write-wins.
pub struct Subscription {
    key: String,
    rx: broadcast::Receiver<StoredValue>,
}

impl Subscription {
    /// Creates a subscription over a broadcast receiver.
    pub fn new(key: impl Into<String>, rx: broadcast::Receiver<StoredValue>) -> Self {
        Self { key: key.into(), rx }
    }
    
    /// Returns the subscribed key.
    pub fn key(&self) -> &str {
        &self.key
    }
    
    /// Waits for the next value. Returns `None` once the store closes the key.
    pub async fn next(&mut self) -> Option<StoredValue> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
    
    /// Returns the next already-delivered value without waiting.
    pub fn try_next(&mut self) -> Option<StoredValue> {
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Fault injection for store implementations used in simulation.
pub trait StoreController: Send + Sync {
    /// Cuts a peer off from the store: its writes are lost, its reads see nothing.
    fn isolate(&self, peer: &PeerId);
    
    /// Restores every isolated peer.
    fn heal_all(&self);
    
    /// Sets the visibility delay for values read by `peer`.
    fn set_read_latency(&self, peer: &PeerId, latency_ms: u64);
    
    /// Sets the probability (0.0 - 1.0) that a read by `peer` comes back empty.
    fn set_read_loss(&self, peer: &PeerId, loss_rate: f64);
}
