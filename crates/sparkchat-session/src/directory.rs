//! Concurrency-safe cache of imported peer public keys.
//!
//! Keys arrive as serialized strings from several inbound paths at once
//! (messages, typing events, announcements). The directory guarantees that
//! concurrent lookups for the same unseen key trigger exactly one underlying
//! import: the first caller registers a pending marker and runs the import,
//! later callers wait on a `watch` channel and observe the same result. The
//! marker is cleared on failure too, so a bad key never wedges its slot.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use sparkchat_shared::crypto::{import_public_key, PublicKey};
use sparkchat_shared::error::CryptoError;
use sparkchat_shared::types::SerializedKey;

/// A successfully imported peer key: the wire encoding plus the parsed handle.
#[derive(Debug, Clone)]
pub struct ImportedKey {
    pub serialized: SerializedKey,
    pub key: PublicKey,
}

type ImportResult = Result<ImportedKey, CryptoError>;

#[derive(Default)]
struct Inner {
    cache: HashMap<SerializedKey, ImportedKey>,
    pending: HashMap<SerializedKey, watch::Receiver<Option<ImportResult>>>,
}

#[derive(Default)]
pub struct PeerKeyDirectory {
    inner: Mutex<Inner>,
}

enum Claim {
    Ready(ImportedKey),
    Wait(watch::Receiver<Option<ImportResult>>),
    Run(watch::Sender<Option<ImportResult>>),
}

impl PeerKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache lookup without importing.
    pub async fn get(&self, serialized: &SerializedKey) -> Option<ImportedKey> {
        self.inner.lock().await.cache.get(serialized).cloned()
    }

    pub async fn contains(&self, serialized: &SerializedKey) -> bool {
        self.inner.lock().await.cache.contains_key(serialized)
    }

    /// Snapshot of every cached key, used to build the recipient set.
    pub async fn known_keys(&self) -> Vec<ImportedKey> {
        self.inner.lock().await.cache.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.cache.is_empty()
    }

    /// Drop all cached keys and pending markers (connection-epoch reset).
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache.clear();
        inner.pending.clear();
    }

    /// Return the cached key, importing it first if this is the first time
    /// the serialized form is seen. Concurrent callers for the same key
    /// share a single import.
    pub async fn import_or_get(&self, serialized: &SerializedKey) -> ImportResult {
        self.import_or_get_with(serialized, |s| async move { import_public_key(&s) })
            .await
    }

    async fn import_or_get_with<F, Fut>(&self, serialized: &SerializedKey, import: F) -> ImportResult
    where
        F: Fn(SerializedKey) -> Fut,
        Fut: Future<Output = Result<PublicKey, CryptoError>>,
    {
        loop {
            let claim = {
                let mut inner = self.inner.lock().await;
                if let Some(found) = inner.cache.get(serialized) {
                    Claim::Ready(found.clone())
                } else if let Some(rx) = inner.pending.get(serialized) {
                    Claim::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inner.pending.insert(serialized.clone(), rx);
                    Claim::Run(tx)
                }
            };

            match claim {
                Claim::Ready(key) => return Ok(key),
                Claim::Wait(mut rx) => {
                    debug!(key = %serialized.short(), "Waiting on in-flight key import");
                    if rx.changed().await.is_err() {
                        // Importer vanished without publishing. Clear the
                        // stale marker so the re-claim runs the import.
                        let mut inner = self.inner.lock().await;
                        if inner
                            .pending
                            .get(serialized)
                            .map_or(false, |p| p.has_changed().is_err())
                        {
                            inner.pending.remove(serialized);
                        }
                        continue;
                    }
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                }
                Claim::Run(tx) => {
                    let result = import(serialized.clone()).await.map(|key| ImportedKey {
                        serialized: serialized.clone(),
                        key,
                    });

                    let mut inner = self.inner.lock().await;
                    if let Ok(ref imported) = result {
                        inner.cache.insert(serialized.clone(), imported.clone());
                    }
                    inner.pending.remove(serialized);
                    drop(inner);

                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use sparkchat_shared::crypto::KeyPair;

    #[tokio::test]
    async fn test_import_then_get() {
        let dir = PeerKeyDirectory::new();
        let pair = KeyPair::generate().unwrap();
        let serialized = pair.serialized_public();

        assert!(dir.get(&serialized).await.is_none());

        let imported = dir.import_or_get(&serialized).await.unwrap();
        assert_eq!(imported.serialized, serialized);
        assert_eq!(imported.key.as_bytes(), pair.public().as_bytes());

        assert!(dir.contains(&serialized).await);
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_key_not_cached() {
        let dir = PeerKeyDirectory::new();
        let bad = SerializedKey::from("%%%not-a-key%%%");

        assert_eq!(
            dir.import_or_get(&bad).await.unwrap_err(),
            CryptoError::MalformedKey
        );
        assert!(dir.is_empty().await);
        // The pending marker must be gone so a retry is possible.
        assert_eq!(
            dir.import_or_get(&bad).await.unwrap_err(),
            CryptoError::MalformedKey
        );
    }

    #[tokio::test]
    async fn test_concurrent_import_runs_once() {
        let dir = Arc::new(PeerKeyDirectory::new());
        let pair = KeyPair::generate().unwrap();
        let serialized = pair.serialized_public();
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dir = dir.clone();
            let serialized = serialized.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                dir.import_or_get_with(&serialized, move |s| {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        import_public_key(&s)
                    }
                })
                .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let first = results[0].key;
        assert!(results.iter().all(|r| r.key.as_bytes() == first.as_bytes()));
    }

    #[tokio::test]
    async fn test_failed_import_retried_by_next_caller() {
        let dir = PeerKeyDirectory::new();
        let pair = KeyPair::generate().unwrap();
        let serialized = pair.serialized_public();
        let invocations = Arc::new(AtomicUsize::new(0));

        let counting = |fail: bool| {
            let invocations = invocations.clone();
            move |s: SerializedKey| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(CryptoError::MalformedKey)
                    } else {
                        import_public_key(&s)
                    }
                }
            }
        };

        assert!(dir
            .import_or_get_with(&serialized, counting(true))
            .await
            .is_err());
        assert!(dir
            .import_or_get_with(&serialized, counting(false))
            .await
            .is_ok());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_resets_cache() {
        let dir = PeerKeyDirectory::new();
        let pair = KeyPair::generate().unwrap();
        let serialized = pair.serialized_public();

        dir.import_or_get(&serialized).await.unwrap();
        assert_eq!(dir.len().await, 1);

        dir.clear().await;
        assert!(dir.is_empty().await);
        assert!(dir.get(&serialized).await.is_none());
    }
}
