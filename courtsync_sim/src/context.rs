//! Virtual clock for deterministic session runs.

use async_trait::async_trait;
use courtsync_env::SyncContext;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Odd multiplier spreading the master seed before an extension is mixed in.
const SEED_MIX: u64 = 0x517cc1b727220a95;

/// `SyncContext` for simulation.
///
/// Time stands still until the world (or a peer's `sleep`) moves it. All
/// clones share one clock, so every peer and the store agree on "now".
/// Per-peer randomness comes from `derive_seed`, never from the OS.
#[derive(Clone)]
pub struct SimContext {
    seed: u64,
    elapsed_ns: Arc<Mutex<u64>>,
    /// Wall-clock instant that virtual zero maps to
    origin: SystemTime,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            elapsed_ns: Arc::new(Mutex::new(0)),
            // 2024-01-01T00:00:00Z
            origin: UNIX_EPOCH + Duration::from_secs(1_704_067_200),
        }
    }

    /// Moves the shared clock forward.
    pub fn advance_time(&self, step: Duration) {
        let mut elapsed = lock(&self.elapsed_ns);
        *elapsed = elapsed.saturating_add(step.as_nanos() as u64);
    }

    pub fn time_ns(&self) -> u64 {
        *lock(&self.elapsed_ns)
    }

    /// Virtual milliseconds since start; the store stamps versions with it.
    pub fn now_ms(&self) -> u64 {
        self.time_ns() / 1_000_000
    }
}

#[async_trait]
impl SyncContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.origin + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("spawning {}", name);
        tokio::spawn(future);
    }

    fn derive_seed(&self, seed_extension: u64) -> u64 {
        let mixed = self.seed.wrapping_mul(SEED_MIX) ^ seed_extension;
        ChaCha8Rng::seed_from_u64(mixed).next_u64()
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_only_moves_when_advanced() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_millis(50));
        assert_eq!(ctx.now_ms(), 50);

        ctx.advance_time(Duration::from_millis(450));
        assert_eq!(ctx.now(), Duration::from_millis(500));
        assert_eq!(ctx.system_time(), UNIX_EPOCH + Duration::from_secs(1_704_067_200) + Duration::from_millis(500));
    }

    #[test]
    fn test_derived_seeds_are_reproducible() {
        let a = SimContext::new(42);
        let b = SimContext::new(42);

        assert_eq!(a.derive_seed(1), b.derive_seed(1));
        assert_ne!(a.derive_seed(1), a.derive_seed(2));
        assert_ne!(a.derive_seed(1), SimContext::new(43).derive_seed(1));
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.now_ms(), 50);
    }

    #[test]
    fn test_clones_share_one_clock() {
        let peer_view = SimContext::new(42);
        let store_view = peer_view.clone();

        peer_view.advance_time(Duration::from_secs(5));

        assert_eq!(store_view.now(), Duration::from_secs(5));
    }
}
