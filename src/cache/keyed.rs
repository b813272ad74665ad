//! Typed JSON values over a [`KvStore`].

use crate::cache::keys::CacheKey;
use crate::cache::store::KvStore;
use crate::error::{LabError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// JSON-encoded values addressed by structured keys.
///
/// A miss is `Ok(None)`; decode and storage failures are always errors and
/// are never reported as a miss.
#[derive(Clone)]
pub struct KeyedCache {
    store: Arc<dyn KvStore>,
}

impl KeyedCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &impl CacheKey) -> Result<Option<T>> {
        let raw = key.to_key();
        match self.store.get(&raw).await? {
            Some(bytes) => decode(&raw, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &impl CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set(&key.to_key(), bytes, ttl).await
    }

    /// Calls `f` for every live entry under `prefix`, in key order.
    ///
    /// Entries that fail to decode skip the callback. Decode and callback
    /// failures are collected and returned together as [`LabError::Scan`]
    /// once the scan finishes, or the first one is returned immediately when
    /// `stop_on_first_error` is set.
    pub async fn scan_prefix<T, F>(
        &self,
        prefix: &[u8],
        mut f: F,
        stop_on_first_error: bool,
    ) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(Vec<u8>, T) -> Result<()>,
    {
        let entries = self.store.scan_prefix(prefix).await?;
        let mut errors = Vec::new();
        for (key, bytes) in entries {
            let outcome = decode::<T>(&key, &bytes).and_then(|value| f(key, value));
            if let Err(err) = outcome {
                if stop_on_first_error {
                    return Err(err);
                }
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LabError::Scan {
                prefix: String::from_utf8_lossy(prefix).into_owned(),
                errors,
            })
        }
    }

    pub async fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let removed = self.store.delete_prefix(prefix).await?;
        debug!(prefix = %String::from_utf8_lossy(prefix), removed, "deleted prefix");
        Ok(removed)
    }
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| LabError::Decode {
        key: String::from_utf8_lossy(key).into_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::{ProxyKey, TesterType};
    use crate::cache::store::MemoryStore;

    fn cache() -> (KeyedCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (KeyedCache::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let (cache, _) = cache();
        let key = ProxyKey::new("c", "s", "p");
        let value: Option<u32> = cache.get(&key).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_and_decode_error() {
        let (cache, store) = cache();
        let key = ProxyKey::new("c", "s", "p").result_key(TesterType::Delay);
        cache.set(&key, &42u32, None).await.unwrap();
        assert_eq!(cache.get::<u32>(&key).await.unwrap(), Some(42));

        store.set(&key.to_key(), b"not json".to_vec(), None).await.unwrap();
        let err = cache.get::<u32>(&key).await.unwrap_err();
        assert!(matches!(err, LabError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let (cache, _) = cache();
        let key = ProxyKey::new("c", "s", "p");
        cache
            .set(&key, &"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get::<String>(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_tolerates_bad_entries() {
        let (cache, store) = cache();
        cache.set(&ProxyKey::new("c", "s", "a"), &1u32, None).await.unwrap();
        store
            .set(&ProxyKey::new("c", "s", "b").to_key(), b"{".to_vec(), None)
            .await
            .unwrap();
        cache.set(&ProxyKey::new("c", "s", "c"), &3u32, None).await.unwrap();

        let mut seen = Vec::new();
        let err = cache
            .scan_prefix(
                &ProxyKey::conf_prefix("c"),
                |_, v: u32| {
                    seen.push(v);
                    Ok(())
                },
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(seen, vec![1, 3]);
        match err {
            LabError::Scan { errors, .. } => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_scan_stops_on_first_error() {
        let (cache, store) = cache();
        store
            .set(&ProxyKey::new("c", "s", "a").to_key(), b"{".to_vec(), None)
            .await
            .unwrap();
        cache.set(&ProxyKey::new("c", "s", "b"), &2u32, None).await.unwrap();

        let mut seen = Vec::new();
        let err = cache
            .scan_prefix(
                &ProxyKey::conf_prefix("c"),
                |_, v: u32| {
                    seen.push(v);
                    Ok(())
                },
                true,
            )
            .await
            .unwrap_err();
        assert!(seen.is_empty());
        assert!(matches!(err, LabError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_delete_prefix_scopes_to_conf() {
        let (cache, _) = cache();
        cache.set(&ProxyKey::new("c", "s", "a"), &1u32, None).await.unwrap();
        cache.set(&ProxyKey::new("c2", "s", "a"), &2u32, None).await.unwrap();

        assert_eq!(cache.delete_prefix(&ProxyKey::conf_prefix("c")).await.unwrap(), 1);
        assert_eq!(
            cache.get::<u32>(&ProxyKey::new("c2", "s", "a")).await.unwrap(),
            Some(2)
        );
    }
}
