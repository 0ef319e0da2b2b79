// Object-storage lease lock.
//
// Every grant and renewal is a new object `<token>.<renewal>.json` created
// with `put_if_absent`; the greatest key is the authoritative lease. Two
// contenders for the same token race on the same key, so exactly one wins.
// Superseded records are pruned best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{expiry, LeaseError, LeaseLock, LeaseRecord};
use crate::layout::{parse_lease_key, TableLocation};
use crate::record::NodeId;
use crate::storage::{ObjectStore, StorageError};

/// Lease records kept after pruning.
const RETAINED_RECORDS: usize = 4;

/// Reads racing with a prune are retried this many times.
const READ_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ObjectStoreLock {
    store: Arc<dyn ObjectStore>,
    location: TableLocation,
}

impl ObjectStoreLock {
    pub fn new(store: Arc<dyn ObjectStore>, location: TableLocation) -> Self {
        Self { store, location }
    }

    async fn lease_keys(&self) -> Result<Vec<String>, LeaseError> {
        let mut keys: Vec<_> = self
            .store
            .list(&self.location.leader_prefix())
            .await?
            .into_iter()
            .map(|m| m.key)
            .filter(|k| parse_lease_key(k).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn write(&self, lease: &LeaseRecord) -> Result<(), LeaseError> {
        let key = self.location.lease_key(lease.token, lease.renewal);
        let body = Bytes::from(serde_json::to_vec(lease)?);
        self.store.put_if_absent(&key, body).await?;
        Ok(())
    }

    async fn prune(&self) {
        let keys = match self.lease_keys().await {
            Ok(keys) => keys,
            Err(_) => return,
        };
        let stale = keys.len().saturating_sub(RETAINED_RECORDS);
        for key in &keys[..stale] {
            if let Err(e) = self.store.delete(key).await {
                tracing::debug!(key = %key, error = %e, "lease prune failed");
            }
        }
    }
}

#[async_trait]
impl LeaseLock for ObjectStoreLock {
    async fn current(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        for _ in 0..READ_ATTEMPTS {
            let Some(latest) = self.lease_keys().await?.pop() else {
                return Ok(None);
            };
            match self.store.get(&latest).await {
                Ok(data) => return Ok(Some(serde_json::from_slice(&data)?)),
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::Unavailable("lease records changed during read".into()).into())
    }

    async fn acquire(
        &self,
        node: &NodeId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError> {
        let current = self.current().await?;
        if let Some(current) = &current {
            if !current.is_expired(now) {
                return Err(LeaseError::Held {
                    holder: current.holder.clone(),
                    token: current.token,
                });
            }
        }

        let lease = LeaseRecord {
            holder: node.clone(),
            token: current.map_or(0, |l| l.token) + 1,
            renewal: 0,
            acquired_at: now,
            expires_at: expiry(now, ttl),
        };
        match self.write(&lease).await {
            Ok(()) => {}
            Err(LeaseError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(LeaseError::Contended(lease.token))
            }
            Err(e) => return Err(e),
        }

        self.prune().await;
        Ok(lease)
    }

    async fn renew(
        &self,
        lease: &LeaseRecord,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError> {
        let current = self
            .current()
            .await?
            .ok_or(LeaseError::Expired(lease.token))?;
        if current.token != lease.token || current.renewal != lease.renewal {
            return Err(LeaseError::Stale {
                ours: lease.token,
                current: current.token,
            });
        }
        if current.is_expired(now) {
            return Err(LeaseError::Expired(lease.token));
        }

        let renewed = LeaseRecord {
            renewal: lease.renewal + 1,
            expires_at: expiry(now, ttl),
            ..lease.clone()
        };
        match self.write(&renewed).await {
            Ok(()) => {}
            Err(LeaseError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(LeaseError::Stale {
                    ours: lease.token,
                    current: lease.token,
                })
            }
            Err(e) => return Err(e),
        }

        // a successor may have taken the expired-looking lease concurrently
        if let Some(latest) = self.current().await? {
            if latest.token > renewed.token {
                return Err(LeaseError::Stale {
                    ours: renewed.token,
                    current: latest.token,
                });
            }
        }

        self.prune().await;
        Ok(renewed)
    }

    async fn release(&self, lease: &LeaseRecord, now: DateTime<Utc>) -> Result<(), LeaseError> {
        let released = LeaseRecord {
            renewal: lease.renewal + 1,
            expires_at: now,
            ..lease.clone()
        };
        match self.write(&released).await {
            Ok(()) | Err(LeaseError::Storage(StorageError::AlreadyExists(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryObjectStore, LocalObjectStore, ObjectMeta};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    const TTL: Duration = Duration::from_secs(10);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn lock_on(store: Arc<dyn ObjectStore>) -> ObjectStoreLock {
        ObjectStoreLock::new(store, TableLocation::new("minio", "api_logs"))
    }

    #[tokio::test]
    async fn simultaneous_acquire_has_one_winner() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let a = lock_on(store.clone());
        let b = lock_on(store.clone());

        let (na, nb) = (NodeId::new("a"), NodeId::new("b"));
        let (ra, rb) = tokio::join!(a.acquire(&na, at(0), TTL), b.acquire(&nb, at(0), TTL));

        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        assert_eq!(a.current().await.unwrap().unwrap().token, 1);
    }

    #[tokio::test]
    async fn superseded_holder_cannot_renew() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let lock = lock_on(store);

        let a = lock.acquire(&NodeId::new("a"), at(0), TTL).await.unwrap();
        let a = lock.renew(&a, at(5), TTL).await.unwrap();

        assert!(lock.acquire(&NodeId::new("b"), at(10), TTL).await.is_err());
        let b = lock.acquire(&NodeId::new("b"), at(15), TTL).await.unwrap();
        assert_eq!(b.token, 2);

        let err = lock.renew(&a, at(16), TTL).await.unwrap_err();
        assert!(matches!(err, LeaseError::Stale { ours: 1, current: 2 }));
    }

    #[tokio::test]
    async fn release_frees_lease_immediately() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let lock = lock_on(store);

        let a = lock.acquire(&NodeId::new("a"), at(0), TTL).await.unwrap();
        lock.release(&a, at(1)).await.unwrap();

        let b = lock.acquire(&NodeId::new("b"), at(1), TTL).await.unwrap();
        assert_eq!(b.token, 2);
    }

    #[tokio::test]
    async fn renewals_are_pruned_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::open(dir.path()).await.unwrap());
        let lock = lock_on(store.clone());

        let mut lease = lock.acquire(&NodeId::new("a"), at(0), TTL).await.unwrap();
        for i in 1..10 {
            lease = lock.renew(&lease, at(i), TTL).await.unwrap();
        }

        let records = store
            .list(&TableLocation::new("minio", "api_logs").leader_prefix())
            .await
            .unwrap();
        assert_eq!(records.len(), RETAINED_RECORDS);
        assert_eq!(lock.current().await.unwrap().unwrap().renewal, 9);
    }

    /// Lets a successor's grant land right before the write of `trigger`,
    /// after the renewing holder has already read the lease.
    #[derive(Debug)]
    struct SuccessorFirst {
        inner: Arc<dyn ObjectStore>,
        trigger: String,
        successor: Mutex<Option<(String, Bytes)>>,
    }

    #[async_trait]
    impl ObjectStore for SuccessorFirst {
        async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            self.inner.put(key, data).await
        }

        async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            if key == self.trigger {
                let successor = self.successor.lock().take();
                if let Some((successor_key, body)) = successor {
                    self.inner.put_if_absent(&successor_key, body).await?;
                }
            }
            self.inner.put_if_absent(key, data).await
        }

        async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
            self.inner.get(key).await
        }

        async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError> {
            self.inner.head(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn renewal_racing_a_successor_grant_is_stale() {
        let location = TableLocation::new("minio", "api_logs");
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let lease = lock_on(inner.clone())
            .acquire(&NodeId::new("a"), at(0), TTL)
            .await
            .unwrap();

        let successor = LeaseRecord {
            holder: NodeId::new("b"),
            token: 2,
            renewal: 0,
            acquired_at: at(1),
            expires_at: at(11),
        };
        let store: Arc<dyn ObjectStore> = Arc::new(SuccessorFirst {
            inner: inner.clone(),
            trigger: location.lease_key(lease.token, lease.renewal + 1),
            successor: Mutex::new(Some((
                location.lease_key(2, 0),
                Bytes::from(serde_json::to_vec(&successor).unwrap()),
            ))),
        });

        let err = lock_on(store).renew(&lease, at(1), TTL).await.unwrap_err();
        assert!(matches!(err, LeaseError::Stale { ours: 1, current: 2 }), "{err}");
        assert_eq!(lock_on(inner).current().await.unwrap().unwrap().holder, NodeId::new("b"));
    }
}
