//! Persistence contract (spec §6): CRUD by ID, implementation-free. Real
//! deployments back this with durable storage; this crate ships only the
//! in-memory reference implementation used by tests and by the daemon when
//! no external store is configured.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
}

#[async_trait]
pub trait Store<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn put(&self, key: K, value: V);
    async fn get(&self, key: &K) -> Option<V>;
    async fn remove(&self, key: &K) -> Option<V>;
    async fn list(&self) -> Vec<V>;
    async fn len(&self) -> usize;
}

/// In-memory reference implementation of the persistence contract. Durable
/// deployments swap this for a store backed by the external persistence
/// layer without changing any call site, since callers depend only on
/// [`Store`].
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    inner: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for InMemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V> Default for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<K, V> Store<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync + Clone,
    V: Send + Sync + Clone,
{
    async fn put(&self, key: K, value: V) {
        self.inner.write().await.insert(key, value);
    }

    async fn get(&self, key: &K) -> Option<V> {
        self.inner.read().await.get(key).cloned()
    }

    async fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().await.remove(key)
    }

    async fn list(&self) -> Vec<V> {
        self.inner.read().await.values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store: InMemoryStore<String, u32> = InMemoryStore::new();
        store.put("a".into(), 1).await;
        assert_eq!(store.get(&"a".into()).await, Some(1));
        assert_eq!(store.get(&"missing".into()).await, None);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let store: InMemoryStore<String, u32> = InMemoryStore::new();
        store.put("a".into(), 1).await;
        assert_eq!(store.remove(&"a".into()).await, Some(1));
        assert_eq!(store.len().await, 0);
    }
}
