//! Production implementations of SyncContext and SharedStore using Tokio.

use crate::error::EnvError;
use crate::store::{SharedStore, Subscription};
use crate::types::{Durability, LockMode, PeerId, StoreScope, StoredValue};
use crate::SyncContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;

/// Capacity of each per-key subscription channel.
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Context for real sessions: tokio clock and timers, unseeded randomness.
#[derive(Debug)]
pub struct TokioContext {
    started: Instant,
}

impl TokioContext {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn derive_seed(&self, _seed_extension: u64) -> u64 {
        rand::random()
    }

    fn seed(&self) -> u64 {
        0
    }
}

/// A single key's value plus its subscribers.
struct Entry {
    value: Option<StoredValue>,
    version: u64,
    subscribers: broadcast::Sender<StoredValue>,
}

impl Entry {
    fn new() -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        Self {
            value: None,
            version: 0,
            subscribers,
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<(String, String), Entry>,
}

/// In-process last-write-wins store.
///
/// Every handle created through [`MemoryStore::handle`] shares the same
/// backing map, so peers in one process (or one test) see each other's
/// writes immediately.
pub struct MemoryStore {
    local_id: PeerId,
    inner: Arc<Mutex<MemoryInner>>,
    start: Instant,
}

impl MemoryStore {
    /// Creates a fresh store with a first handle for `local_id`.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            start: Instant::now(),
        }
    }
    
    /// Returns another handle on the same backing map, writing as `peer`.
    pub fn handle(&self, peer: PeerId) -> Self {
        Self {
            local_id: peer,
            inner: Arc::clone(&self.inner),
            start: self.start,
        }
    }
    
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
    
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, EnvError> {
        self.inner
            .lock()
            .map_err(|_| EnvError::store("memory store lock poisoned"))
    }
    
    fn commit(&self, entry: &mut Entry, payload: Vec<u8>) {
        entry.version += 1;
        let value = StoredValue::new(payload, entry.version, self.now_ms(), Some(self.local_id.clone()));
        // No receivers is fine
        let _ = entry.subscribers.send(value.clone());
        entry.value = Some(value);
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn write(
        &self,
        scope: &StoreScope,
        key: &str,
        value: Vec<u8>,
        _durability: Durability,
    ) -> Result<(), EnvError> {
        let mut inner = self.lock()?;
        let entry = inner
            .entries
            .entry((scope.0.clone(), key.to_string()))
            .or_insert_with(Entry::new);
        self.commit(entry, value);
        Ok(())
    }
    
    async fn read(
        &self,
        scope: &StoreScope,
        key: &str,
        _lock: LockMode,
    ) -> Result<Option<StoredValue>, EnvError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .get(&(scope.0.clone(), key.to_string()))
            .and_then(|e| e.value.clone()))
    }
    
    async fn subscribe(&self, scope: &StoreScope, key: &str) -> Result<Subscription, EnvError> {
        let mut inner = self.lock()?;
        let entry = inner
            .entries
            .entry((scope.0.clone(), key.to_string()))
            .or_insert_with(Entry::new);
        Ok(Subscription::new(key, entry.subscribers.subscribe()))
    }
    
    async fn remove(&self, scope: &StoreScope, key: &str) -> Result<(), EnvError> {
        let mut inner = self.lock()?;
        if let Some(entry) = inner.entries.get_mut(&(scope.0.clone(), key.to_string())) {
            entry.value = None;
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
        let mut inner = self.lock()?;
        let entry = inner
            .entries
            .entry((scope.0.clone(), key.to_string()))
            .or_insert_with(Entry::new);
        let current = entry.value.as_ref().map(|v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        self.commit(entry, value);
        Ok(true)
    }
    
    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn scope() -> StoreScope {
        StoreScope::new("game")
    }
    
    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();
        
        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }
    
    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }

    #[tokio::test]
    async fn test_spawned_task_runs() {
        let ctx = TokioContext::shared();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("ping", async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }
    
    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let a = MemoryStore::new(PeerId::new("a"));
        let b = a.handle(PeerId::new("b"));
        
        a.write(&scope(), "k", b"one".to_vec(), Durability::Ephemeral).await.unwrap();
        b.write(&scope(), "k", b"two".to_vec(), Durability::Ephemeral).await.unwrap();
        
        let value = a.read(&scope(), "k", LockMode::Shared).await.unwrap().unwrap();
        assert_eq!(value.payload, b"two".to_vec());
        assert_eq!(value.version, 2);
        assert_eq!(value.writer, Some(PeerId::new("b")));
    }
    
    #[tokio::test]
    async fn test_memory_store_missing_and_removed_read_none() {
        let store = MemoryStore::new(PeerId::new("a"));
        assert!(store.read(&scope(), "nope", LockMode::Shared).await.unwrap().is_none());
        
        store.write(&scope(), "k", vec![1], Durability::Persistent).await.unwrap();
        store.remove(&scope(), "k").await.unwrap();
        assert!(store.read(&scope(), "k", LockMode::Shared).await.unwrap().is_none());
    }
    
    #[tokio::test]
    async fn test_memory_store_compare_and_swap() {
        let a = MemoryStore::new(PeerId::new("a"));
        let b = a.handle(PeerId::new("b"));
        
        // Absent key: only the first CAS against None wins
        assert!(a.compare_and_swap(&scope(), "c", None, vec![1]).await.unwrap());
        assert!(!b.compare_and_swap(&scope(), "c", None, vec![2]).await.unwrap());
        
        // Stale version loses
        assert!(b.compare_and_swap(&scope(), "c", Some(1), vec![3]).await.unwrap());
        assert!(!a.compare_and_swap(&scope(), "c", Some(1), vec![4]).await.unwrap());
        
        let value = a.read(&scope(), "c", LockMode::Exclusive).await.unwrap().unwrap();
        assert_eq!(value.payload, vec![3]);
    }
    
    #[tokio::test]
    async fn test_memory_store_subscription_receives_writes() {
        let store = MemoryStore::new(PeerId::new("a"));
        let mut sub = store.subscribe(&scope(), "s").await.unwrap();
        
        store.write(&scope(), "s", vec![9], Durability::Ephemeral).await.unwrap();
        
        let value = sub.next().await.unwrap();
        assert_eq!(value.payload, vec![9]);
        assert!(sub.try_next().is_none());
    }
}
