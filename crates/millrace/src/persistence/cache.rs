//! Ephemeral state cache: derived, never authoritative.
//!
//! The command processor keeps the latest reconstructed state here to avoid
//! replaying the log on every command. Entries can be evicted freely; a
//! miss falls back to a full reload from the event log.

use std::marker::PhantomData;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::model::StoredState;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backing store (KV bucket) error
    #[error("cache backend error: {0}")]
    Backend(String),

    /// State (de)serialization error
    #[error("cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Cache of the latest reconstructed state per workflow instance.
#[async_trait]
pub trait EphemeralStorage<S>: Send + Sync + 'static {
    async fn put_state(&self, new: StoredState<S>) -> Result<(), CacheError>;

    async fn get_state(&self, workflow_id: &str) -> Result<Option<StoredState<S>>, CacheError>;

    async fn remove_state(&self, workflow_id: &str) -> Result<(), CacheError>;
}

/// In-process LRU cache of hydrated states.
///
/// A cache hit returns the state with no serialization cost. Works well
/// with partitioned runners where each runner owns a fixed subset of
/// workflow ids.
pub struct InProcessStorage<S> {
    cache: Mutex<LruCache<String, StoredState<S>>>,
}

impl<S> InProcessStorage<S> {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl<S> Default for InProcessStorage<S> {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl<S> EphemeralStorage<S> for InProcessStorage<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn put_state(&self, new: StoredState<S>) -> Result<(), CacheError> {
        self.cache.lock().put(new.id.clone(), new);
        Ok(())
    }

    async fn get_state(&self, workflow_id: &str) -> Result<Option<StoredState<S>>, CacheError> {
        Ok(self.cache.lock().get(workflow_id).cloned())
    }

    async fn remove_state(&self, workflow_id: &str) -> Result<(), CacheError> {
        self.cache.lock().pop(workflow_id);
        Ok(())
    }
}

/// Shared cache backed by a NATS JetStream key-value bucket.
///
/// States are stored JSON-encoded under the workflow id, so any process in
/// the deployment can warm-start from the same bucket.
pub struct NatsKvStorage<S> {
    store: async_nats::jetstream::kv::Store,
    _state: PhantomData<fn() -> S>,
}

impl<S> NatsKvStorage<S> {
    pub fn new(store: async_nats::jetstream::kv::Store) -> Self {
        Self {
            store,
            _state: PhantomData,
        }
    }

    /// Open the bucket, creating it if it does not exist yet.
    pub async fn connect(
        context: &async_nats::jetstream::Context,
        bucket: &str,
    ) -> Result<Self, CacheError> {
        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(async_nats::jetstream::kv::Config {
                    bucket: bucket.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?,
        };
        Ok(Self::new(store))
    }
}

#[async_trait]
impl<S> EphemeralStorage<S> for NatsKvStorage<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn put_state(&self, new: StoredState<S>) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(&new)?;
        self.store
            .put(new.id.as_str(), payload.into())
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_state(&self, workflow_id: &str) -> Result<Option<StoredState<S>>, CacheError> {
        let entry = self
            .store
            .get(workflow_id)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        match entry {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove_state(&self, workflow_id: &str) -> Result<(), CacheError> {
        self.store
            .purge(workflow_id)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Two-tier cache: in-process LRU in front of a shared KV bucket.
///
/// Reads try L1 first; an L2 hit populates L1. Writes go to both tiers so
/// L1 is always warm after a write.
pub struct TieredStorage<S> {
    l1: InProcessStorage<S>,
    l2: NatsKvStorage<S>,
}

impl<S> TieredStorage<S> {
    pub fn new(l1: InProcessStorage<S>, l2: NatsKvStorage<S>) -> Self {
        Self { l1, l2 }
    }
}

#[async_trait]
impl<S> EphemeralStorage<S> for TieredStorage<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn put_state(&self, new: StoredState<S>) -> Result<(), CacheError> {
        self.l1.put_state(new.clone()).await?;
        self.l2.put_state(new).await
    }

    async fn get_state(&self, workflow_id: &str) -> Result<Option<StoredState<S>>, CacheError> {
        if let Some(state) = self.l1.get_state(workflow_id).await? {
            return Ok(Some(state));
        }
        match self.l2.get_state(workflow_id).await? {
            Some(state) => {
                self.l1.put_state(state.clone()).await?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn remove_state(&self, workflow_id: &str) -> Result<(), CacheError> {
        self.l1.remove_state(workflow_id).await?;
        self.l2.remove_state(workflow_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct State {
        n: i64,
    }

    fn stored(id: &str, version: i64, n: i64) -> StoredState<State> {
        StoredState::new(id, version, State { n })
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let cache = InProcessStorage::new(4);
        cache.put_state(stored("a", 1, 10)).await.unwrap();

        let got = cache.get_state("a").await.unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.state, State { n: 10 });

        cache.remove_state("a").await.unwrap();
        assert!(cache.get_state("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let cache = InProcessStorage::new(2);
        cache.put_state(stored("a", 1, 1)).await.unwrap();
        cache.put_state(stored("b", 1, 2)).await.unwrap();

        // Touch "a" so "b" becomes the eviction candidate.
        cache.get_state("a").await.unwrap();
        cache.put_state(stored("c", 1, 3)).await.unwrap();

        assert!(cache.get_state("a").await.unwrap().is_some());
        assert!(cache.get_state("b").await.unwrap().is_none());
        assert!(cache.get_state("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_entry() {
        let cache = InProcessStorage::new(2);
        cache.put_state(stored("a", 1, 1)).await.unwrap();
        cache.put_state(stored("a", 2, 5)).await.unwrap();

        let got = cache.get_state("a").await.unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(cache.len(), 1);
    }
}
