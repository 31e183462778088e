//! Secret Store (C1): opaque retrieval of named secrets with a caller-side
//! TTL cache, per spec §6.4. The actual secret backend (vault, KMS, env) is
//! external; this module only defines the interface and the cache in front
//! of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// External secret backend, consumed narrowly per spec §6.4.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn secret_get(&self, name: &str) -> Option<Vec<u8>>;
}

struct CachedEntry {
    value: Vec<u8>,
    fetched_at: Instant,
}

/// Wraps any `SecretStore` with a TTL cache so repeated lookups of the same
/// name within the TTL window don't round-trip to the backend.
pub struct CachingSecretStore<S: SecretStore> {
    inner: S,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, CachedEntry>>>,
}

impl<S: SecretStore> CachingSecretStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.cache.read().await.get(name) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
        }

        let value = self.inner.secret_get(name).await?;
        self.cache.write().await.insert(
            name.to_string(),
            CachedEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Some(value)
    }

    /// Drop a cached entry, forcing the next `get` to re-fetch.
    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
        value: Vec<u8>,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn secret_get(&self, _name: &str) -> Option<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.value.clone())
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let store = CachingSecretStore::new(
            CountingStore {
                calls: AtomicUsize::new(0),
                value: b"sk-test".to_vec(),
            },
            Duration::from_secs(60),
        );

        assert_eq!(store.get("api-key").await, Some(b"sk-test".to_vec()));
        assert_eq!(store.get("api-key").await, Some(b"sk-test".to_vec()));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let store = CachingSecretStore::new(
            CountingStore {
                calls: AtomicUsize::new(0),
                value: b"sk-test".to_vec(),
            },
            Duration::from_secs(60),
        );

        store.get("api-key").await;
        store.invalidate("api-key").await;
        store.get("api-key").await;
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 2);
    }
}
