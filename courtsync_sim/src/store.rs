//! Simulated shared store with fault injection.
//!
//! Every key keeps a short version history stamped with virtual time, so a
//! reader with latency `L` sees the newest version written at or before
//! `now - L`. Loss turns a read into a timeout and isolation cuts a peer
//! off entirely. Compare-and-swap always checks the newest version.

use crate::context::SimContext;
use async_trait::async_trait;
use courtsync_env::{
    Durability, EnvError, LockMode, PeerId, SharedStore, StoreController, StoreScope, StoredValue, Subscription,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Versions kept per key; enough to cover any configured latency.
const HISTORY_DEPTH: usize = 64;
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Store-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub writes: u64,
    pub reads: u64,
    pub dropped_reads: u64,
    pub rejected: u64,
    pub cas_conflicts: u64,
}

struct KeyState {
    history: VecDeque<StoredValue>,
    last_version: u64,
    subscribers: broadcast::Sender<StoredValue>,
}

impl KeyState {
    fn new() -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        Self {
            history: VecDeque::new(),
            last_version: 0,
            subscribers,
        }
    }

    fn newest(&self) -> Option<&StoredValue> {
        self.history.back()
    }

    /// Newest version visible to a reader `latency_ms` behind.
    fn visible(&self, now_ms: u64, latency_ms: u64) -> Option<&StoredValue> {
        self.history
            .iter()
            .rev()
            .find(|v| v.written_at_ms.saturating_add(latency_ms) <= now_ms)
    }

    fn append(&mut self, payload: Vec<u8>, now_ms: u64, writer: PeerId) -> StoredValue {
        self.last_version += 1;
        let value = StoredValue::new(payload, self.last_version, now_ms, Some(writer));
        if self.history.len() >= HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back(value.clone());
        // No receivers is fine
        let _ = self.subscribers.send(value.clone());
        value
    }
}

struct SimStoreInner {
    entries: HashMap<(String, String), KeyState>,
    latency_ms: HashMap<PeerId, u64>,
    loss: HashMap<PeerId, f64>,
    isolated: HashSet<PeerId>,
    rng: ChaCha8Rng,
    stats: StoreStats,
}

type Shared = Arc<Mutex<SimStoreInner>>;

fn lock(inner: &Shared) -> MutexGuard<'_, SimStoreInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A peer's handle on the simulated store.
pub struct SimStore {
    local_id: PeerId,
    inner: Shared,
    context: Arc<SimContext>,
}

impl SimStore {
    /// Creates a fresh store whose first handle writes as `local_id`.
    pub fn new(local_id: PeerId, context: Arc<SimContext>, seed: u64) -> Self {
        let inner = SimStoreInner {
            entries: HashMap::new(),
            latency_ms: HashMap::new(),
            loss: HashMap::new(),
            isolated: HashSet::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: StoreStats::default(),
        };
        Self {
            local_id,
            inner: Arc::new(Mutex::new(inner)),
            context,
        }
    }

    /// Another handle on the same store, writing as `peer`.
    pub fn handle(&self, peer: PeerId) -> Self {
        Self {
            local_id: peer,
            inner: Arc::clone(&self.inner),
            context: Arc::clone(&self.context),
        }
    }

    /// Fault-injection controller for this store.
    pub fn controller(&self) -> SimStoreController {
        SimStoreController {
            inner: Arc::clone(&self.inner),
        }
    }

    fn entry_key(scope: &StoreScope, key: &str) -> (String, String) {
        (scope.as_str().to_string(), key.to_string())
    }

    /// Isolated peers cannot touch the store.
    fn check_reachable(&self, inner: &mut SimStoreInner) -> Result<(), EnvError> {
        if inner.isolated.contains(&self.local_id) {
            inner.stats.rejected += 1;
            return Err(EnvError::unreachable(&self.local_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for SimStore {
    async fn write(
        &self,
        scope: &StoreScope,
        key: &str,
        value: Vec<u8>,
        _durability: Durability,
    ) -> Result<(), EnvError> {
        let now_ms = self.context.now_ms();
        let mut inner = lock(&self.inner);
        self.check_reachable(&mut inner)?;

        inner.stats.writes += 1;
        inner
            .entries
            .entry(Self::entry_key(scope, key))
            .or_insert_with(KeyState::new)
            .append(value, now_ms, self.local_id.clone());
        Ok(())
    }

    async fn read(
        &self,
        scope: &StoreScope,
        key: &str,
        lock_mode: LockMode,
    ) -> Result<Option<StoredValue>, EnvError> {
        let now_ms = self.context.now_ms();
        let mut inner = lock(&self.inner);
        self.check_reachable(&mut inner)?;
        inner.stats.reads += 1;

        let latency = inner.latency_ms.get(&self.local_id).copied().unwrap_or(0);
        let loss = inner.loss.get(&self.local_id).copied().unwrap_or(0.0);
        if loss > 0.0 && inner.rng.gen::<f64>() < loss {
            inner.stats.dropped_reads += 1;
            return Err(EnvError::Timeout(latency));
        }

        let Some(state) = inner.entries.get(&Self::entry_key(scope, key)) else {
            return Ok(None);
        };
        let value = match lock_mode {
            // A read before a CAS must see what the CAS will compare against
            LockMode::Exclusive => state.newest(),
            LockMode::Shared => state.visible(now_ms, latency),
        };
        Ok(value.cloned())
    }

    async fn subscribe(&self, scope: &StoreScope, key: &str) -> Result<Subscription, EnvError> {
        let mut inner = lock(&self.inner);
        self.check_reachable(&mut inner)?;
        let rx = inner
            .entries
            .entry(Self::entry_key(scope, key))
            .or_insert_with(KeyState::new)
            .subscribers
            .subscribe();
        Ok(Subscription::new(key, rx))
    }

    async fn remove(&self, scope: &StoreScope, key: &str) -> Result<(), EnvError> {
        let mut inner = lock(&self.inner);
        self.check_reachable(&mut inner)?;
        if let Some(state) = inner.entries.get_mut(&Self::entry_key(scope, key)) {
            state.history.clear();
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        scope: &StoreScope,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<bool, EnvError> {
        let now_ms = self.context.now_ms();
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        self.check_reachable(inner)?;

        let state = inner
            .entries
            .entry(Self::entry_key(scope, key))
            .or_insert_with(KeyState::new);
        let current = state.newest().map(|v| v.version);
        if current != expected_version {
            inner.stats.cas_conflicts += 1;
            return Ok(false);
        }
        state.append(value, now_ms, self.local_id.clone());
        inner.stats.writes += 1;
        Ok(true)
    }

    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }
}

/// Fault injection for a [`SimStore`].
#[derive(Clone)]
pub struct SimStoreController {
    inner: Shared,
}

impl SimStoreController {
    pub fn stats(&self) -> StoreStats {
        lock(&self.inner).stats
    }

    pub fn is_isolated(&self, peer: &PeerId) -> bool {
        lock(&self.inner).isolated.contains(peer)
    }

    /// Clears latency and loss for every peer.
    pub fn clear_link_faults(&self) {
        let mut inner = lock(&self.inner);
        inner.latency_ms.clear();
        inner.loss.clear();
    }
}

impl StoreController for SimStoreController {
    fn isolate(&self, peer: &PeerId) {
        lock(&self.inner).isolated.insert(peer.clone());
    }

    fn heal_all(&self) {
        lock(&self.inner).isolated.clear();
    }

    fn set_read_latency(&self, peer: &PeerId, latency_ms: u64) {
        lock(&self.inner).latency_ms.insert(peer.clone(), latency_ms);
    }

    fn set_read_loss(&self, peer: &PeerId, loss_rate: f64) {
        lock(&self.inner)
            .loss
            .insert(peer.clone(), loss_rate.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn setup() -> (Arc<SimContext>, SimStore, StoreScope) {
        let ctx = Arc::new(SimContext::new(42));
        let store = SimStore::new(PeerId::new("p1"), Arc::clone(&ctx), 7);
        (ctx, store, StoreScope::new("game"))
    }

    #[tokio::test]
    async fn test_latency_hides_fresh_versions() {
        let (ctx, store, scope) = setup();
        let reader = store.handle(PeerId::new("p2"));
        store.controller().set_read_latency(&PeerId::new("p2"), 100);

        store.write(&scope, "k", b"v1".to_vec(), Durability::Ephemeral).await.unwrap();
        ctx.advance_time(Duration::from_millis(60));
        store.write(&scope, "k", b"v2".to_vec(), Durability::Ephemeral).await.unwrap();

        // Nothing is 100ms old yet
        assert!(reader.read(&scope, "k", LockMode::Shared).await.unwrap().is_none());

        ctx.advance_time(Duration::from_millis(50));
        let seen = reader.read(&scope, "k", LockMode::Shared).await.unwrap().unwrap();
        assert_eq!(seen.payload, b"v1".to_vec());

        // The writer itself has no latency
        let own = store.read(&scope, "k", LockMode::Shared).await.unwrap().unwrap();
        assert_eq!(own.payload, b"v2".to_vec());
        assert_eq!(own.written_at_ms, 60);
    }

    #[tokio::test]
    async fn test_isolation_and_heal() {
        let (_ctx, store, scope) = setup();
        let controller = store.controller();
        controller.isolate(&PeerId::new("p1"));

        let err = store
            .write(&scope, "k", b"v".to_vec(), Durability::Ephemeral)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(controller.stats().rejected, 1);

        controller.heal_all();
        store.write(&scope, "k", b"v".to_vec(), Durability::Ephemeral).await.unwrap();
        assert!(!controller.is_isolated(&PeerId::new("p1")));
    }

    #[tokio::test]
    async fn test_total_loss_times_out() {
        let (_ctx, store, scope) = setup();
        store.controller().set_read_loss(&PeerId::new("p1"), 1.0);

        let result = store.read(&scope, "k", LockMode::Shared).await;
        assert!(matches!(result, Err(EnvError::Timeout(_))));
        assert_eq!(store.controller().stats().dropped_reads, 1);
    }

    #[tokio::test]
    async fn test_cas_checks_newest_version() {
        let (_ctx, store, scope) = setup();
        let other = store.handle(PeerId::new("p2"));

        assert!(store.compare_and_swap(&scope, "c", None, b"a".to_vec()).await.unwrap());
        assert!(!other.compare_and_swap(&scope, "c", None, b"b".to_vec()).await.unwrap());
        assert!(other.compare_and_swap(&scope, "c", Some(1), b"b".to_vec()).await.unwrap());

        let value = store.read(&scope, "c", LockMode::Exclusive).await.unwrap().unwrap();
        assert_eq!(value.version, 2);
        assert_eq!(value.writer, Some(PeerId::new("p2")));
        assert_eq!(store.controller().stats().cas_conflicts, 1);
    }

    proptest! {
        #[test]
        fn test_visible_version_respects_latency(
            gaps in proptest::collection::vec(0u64..80, 1..20),
            latency in 0u64..300,
            extra in 0u64..300,
        ) {
            let mut key = KeyState::new();
            let mut now = 0;
            for gap in &gaps {
                now += gap;
                key.append(Vec::new(), now, PeerId::new("p1"));
            }
            let read_at = now + extra;

            let seen = key.visible(read_at, latency);
            let expected = key
                .history
                .iter()
                .filter(|v| v.written_at_ms + latency <= read_at)
                .map(|v| v.version)
                .max();
            prop_assert_eq!(seen.map(|v| v.version), expected);
        }
    }

    #[tokio::test]
    async fn test_subscription_sees_writes() {
        let (_ctx, store, scope) = setup();
        let mut sub = store.subscribe(&scope, "k").await.unwrap();

        store.write(&scope, "k", b"x".to_vec(), Durability::Ephemeral).await.unwrap();

        let value = sub.try_next().unwrap();
        assert_eq!(value.payload, b"x".to_vec());
        assert_eq!(sub.key(), "k");
    }
}
