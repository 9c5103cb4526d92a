//! Endpoint registry: the shard index to backend mapping.
//!
//! The registry is the only state shared between the membership watcher
//! (sole writer) and the router (reader on every dispatch). Entries are
//! stored as `Arc<EndpointInfo>` and swapped whole under a write lock, so a
//! reader holding an entry always sees a consistent host, port and handle.
//!
//! Replacing or removing an entry closes the superseded handle on a
//! background task. Dispatches that already cloned the old `Arc` keep
//! working until their command completes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tracing::debug;

use crate::ShardIndex;
use crate::client::backend::Backend;

/// Connection info for one shard.
#[derive(Debug)]
pub struct EndpointInfo<B> {
    /// Hostname or IP of the shard's store.
    pub host: String,
    /// Port of the shard's store.
    pub port: u16,
    /// Open handle to the store.
    pub backend: B,
    /// Coordination node this entry was read from.
    pub source_path: String,
}

impl<B> EndpointInfo<B> {
    /// Create a new endpoint entry.
    pub fn new(host: impl Into<String>, port: u16, backend: B, source_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            backend,
            source_path: source_path.into(),
        }
    }

    /// Check whether this entry points at `host:port`.
    pub fn is_at(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    /// `host:port` form of the endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Summary of one registry entry, without the handle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EndpointSummary {
    pub index: ShardIndex,
    pub host: String,
    pub port: u16,
    pub source_path: String,
}

/// Outcome of [`EndpointRegistry::resolve`].
#[derive(Debug)]
pub enum Resolution<B> {
    /// No shard is registered.
    Empty,
    /// The selected shard has an endpoint.
    Found {
        index: ShardIndex,
        endpoint: Arc<EndpointInfo<B>>,
    },
    /// The selected index has no entry (sparse indices or vacated shard).
    Missing { index: ShardIndex, shard_count: usize },
}

/// Concurrent shard index to endpoint mapping.
pub struct EndpointRegistry<B> {
    slots: RwLock<BTreeMap<ShardIndex, Arc<EndpointInfo<B>>>>,
    generation: watch::Sender<u64>,
}

impl<B: Backend> Default for EndpointRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> EndpointRegistry<B> {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            slots: RwLock::new(BTreeMap::new()),
            generation,
        }
    }

    /// Look up the endpoint for a shard.
    pub async fn get(&self, index: ShardIndex) -> Option<Arc<EndpointInfo<B>>> {
        self.slots.read().await.get(&index).cloned()
    }

    /// Pick a shard from the current size and look it up under one read lock.
    ///
    /// `select` is not called when the registry is empty.
    pub async fn resolve<F>(&self, select: F) -> Resolution<B>
    where
        F: FnOnce(usize) -> ShardIndex,
    {
        let slots = self.slots.read().await;
        let shard_count = slots.len();
        if shard_count == 0 {
            return Resolution::Empty;
        }
        let index = select(shard_count);
        match slots.get(&index) {
            Some(endpoint) => Resolution::Found {
                index,
                endpoint: endpoint.clone(),
            },
            None => Resolution::Missing { index, shard_count },
        }
    }

    /// Install or replace the endpoint for a shard.
    pub async fn set(&self, index: ShardIndex, info: EndpointInfo<B>) {
        let previous = self.slots.write().await.insert(index, Arc::new(info));
        self.bump();
        if let Some(old) = previous {
            debug!(shard = index, endpoint = %old.address(), "Replaced shard endpoint");
            release(old);
        }
    }

    /// Remove the endpoint for a shard, returning whether one was present.
    pub async fn remove(&self, index: ShardIndex) -> bool {
        let previous = self.slots.write().await.remove(&index);
        match previous {
            Some(old) => {
                self.bump();
                debug!(shard = index, endpoint = %old.address(), "Removed shard endpoint");
                release(old);
                true
            }
            None => false,
        }
    }

    /// Remove every endpoint.
    pub async fn clear(&self) {
        let drained = std::mem::take(&mut *self.slots.write().await);
        if drained.is_empty() {
            return;
        }
        self.bump();
        for (_, old) in drained {
            release(old);
        }
    }

    /// Number of registered shards.
    pub async fn size(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Registered shard indices in ascending order.
    pub async fn indices(&self) -> Vec<ShardIndex> {
        self.slots.read().await.keys().copied().collect()
    }

    /// Describe every entry.
    pub async fn snapshot(&self) -> Vec<EndpointSummary> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(index, info)| EndpointSummary {
                index: *index,
                host: info.host.clone(),
                port: info.port,
                source_path: info.source_path.clone(),
            })
            .collect()
    }

    /// Subscribe to the mutation counter; it increases on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Current mutation counter.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// Close a superseded handle without blocking the writer.
fn release<B: Backend>(old: Arc<EndpointInfo<B>>) {
    tokio::spawn(async move {
        old.backend.close().await;
    });
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::client::backend::{BackendError, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct FakeBackend {
        closed: Arc<AtomicBool>,
    }

    impl Backend for FakeBackend {
        async fn execute(&self, _operation: &str, _args: Vec<Value>) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn entry(host: &str, port: u16, index: ShardIndex) -> EndpointInfo<FakeBackend> {
        EndpointInfo::new(host, port, FakeBackend::default(), format!("/redis/servers/cluster/{index}"))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let registry = EndpointRegistry::new();
        registry.set(0, entry("10.0.0.1", 6379, 0)).await;

        let info = registry.get(0).await.unwrap();
        assert!(info.is_at("10.0.0.1", 6379));
        assert_eq!(info.source_path, "/redis/servers/cluster/0");
        assert!(registry.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_size_counts_entries_not_max_index() {
        let registry = EndpointRegistry::new();
        registry.set(0, entry("10.0.0.1", 6379, 0)).await;
        registry.set(7, entry("10.0.0.8", 6379, 7)).await;

        assert_eq!(registry.size().await, 2);
        assert_eq!(registry.indices().await, vec![0, 7]);
    }

    #[tokio::test]
    async fn test_replace_closes_previous_handle() {
        let registry = EndpointRegistry::new();
        let first = entry("10.0.0.1", 6379, 0);
        let closed = first.backend.closed.clone();
        registry.set(0, first).await;

        registry.set(0, entry("10.0.0.2", 6380, 0)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(closed.load(Ordering::SeqCst));
        let info = registry.get(0).await.unwrap();
        assert_eq!(info.address(), "10.0.0.2:6380");
    }

    #[tokio::test]
    async fn test_reader_keeps_old_entry_after_replace() {
        let registry = EndpointRegistry::new();
        registry.set(0, entry("10.0.0.1", 6379, 0)).await;
        let held = registry.get(0).await.unwrap();

        registry.set(0, entry("10.0.0.2", 6380, 0)).await;

        // The held entry is never mutated in place.
        assert_eq!(held.address(), "10.0.0.1:6379");
        assert_eq!(registry.get(0).await.unwrap().address(), "10.0.0.2:6380");
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = EndpointRegistry::new();
        registry.set(1, entry("10.0.0.2", 6379, 1)).await;

        assert!(registry.remove(1).await);
        assert!(!registry.remove(1).await);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_generation_tracks_mutations() {
        let registry = EndpointRegistry::new();
        let mut rx = registry.subscribe();
        assert_eq!(registry.generation(), 0);

        registry.set(0, entry("10.0.0.1", 6379, 0)).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        // Removing a missing entry is not a mutation.
        registry.remove(5).await;
        assert_eq!(registry.generation(), 1);

        registry.clear().await;
        assert_eq!(registry.generation(), 2);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_resolve() {
        let registry = EndpointRegistry::<FakeBackend>::new();
        assert!(matches!(
            registry.resolve(|_| unreachable!("empty registry")).await,
            Resolution::Empty
        ));

        registry.set(0, entry("10.0.0.1", 6379, 0)).await;
        registry.set(2, entry("10.0.0.3", 6379, 2)).await;

        match registry.resolve(|count| count as ShardIndex - 2).await {
            Resolution::Found { index, endpoint } => {
                assert_eq!(index, 0);
                assert_eq!(endpoint.address(), "10.0.0.1:6379");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }

        // Two entries, index 1 never registered.
        assert!(matches!(
            registry.resolve(|_| 1).await,
            Resolution::Missing { index: 1, shard_count: 2 }
        ));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let registry = EndpointRegistry::new();
        registry.set(1, entry("10.0.0.2", 6379, 1)).await;
        registry.set(0, entry("10.0.0.1", 6379, 0)).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].index, 0);
        assert_eq!(snapshot[1].host, "10.0.0.2");
    }
}
