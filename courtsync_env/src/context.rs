//! Clock, task and seed access for session peers.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// Everything a peer needs from its surroundings besides the shared store.
///
/// `TokioContext` backs it with the tokio clock and OS randomness;
/// `courtsync_sim::SimContext` with a virtual clock that only the harness
/// moves and a master seed. Peer code never reads time or entropy any
/// other way, so a simulated session replays exactly from its seed.
#[async_trait]
pub trait SyncContext: Send + Sync + 'static {
    /// Monotonic time since the context was created.
    fn now(&self) -> Duration;

    /// Wall-clock time, used to stamp store writes.
    fn system_time(&self) -> SystemTime;

    /// Waits one frame (or any other span). A virtual clock just advances.
    async fn sleep(&self, duration: Duration);

    /// Runs a detached task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Seed for a per-peer RNG, reproducible for a given extension under
    /// a seeded context.
    fn derive_seed(&self, seed_extension: u64) -> u64;

    /// Master seed; 0 when the context is not seeded.
    fn seed(&self) -> u64;
}
