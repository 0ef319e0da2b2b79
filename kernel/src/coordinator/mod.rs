// Commit Coordinator
//
// Runs on every node but acts only while the local elector holds the lease.
// Each tick merges all pending segments from all nodes into one new
// snapshot, then clears the pending entries it consumed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::catalog::{CatalogError, SnapshotId, TableCatalog};
use crate::layout::TableLocation;
use crate::lease::{FencingToken, LeaseError, LeaseLock, Leadership};
use crate::segment::{list_pending, PendingIndexEntry, Segment, SegmentError};
use crate::storage::{ObjectStore, StorageError};

/// Catalog conflicts retried within one tick.
const CONFLICT_RETRIES: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("pending index error: {0}")]
    Pending(#[from] SegmentError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This node is not the leader.
    Inactive,

    /// Nothing to commit.
    Idle,

    Committed {
        snapshot_id: SnapshotId,
        segments: usize,
        rows: u64,
    },

    /// Leadership was lost before the snapshot was written.
    Aborted { token: FencingToken },

    /// The catalog has seen a newer leader.
    Fenced { token: FencingToken, highest: FencingToken },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub commits: u64,
    pub segments_committed: u64,
    pub rows_committed: u64,
    pub conflicts: u64,
    pub aborts: u64,
}

pub struct CommitCoordinator {
    store: Arc<dyn ObjectStore>,
    location: TableLocation,
    catalog: Arc<dyn TableCatalog>,
    lock: Arc<dyn LeaseLock>,
    leadership: watch::Receiver<Leadership>,
    stats: CoordinatorStats,
}

impl CommitCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        location: TableLocation,
        catalog: Arc<dyn TableCatalog>,
        lock: Arc<dyn LeaseLock>,
        leadership: watch::Receiver<Leadership>,
    ) -> Self {
        Self {
            store,
            location,
            catalog,
            lock,
            leadership,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    fn still_leader(&self, token: FencingToken) -> bool {
        self.leadership.borrow().is_leader_with(token)
    }

    /// The lock itself still names `token` as the live lease. The local
    /// elector may not have noticed a successor yet.
    async fn lease_confirmed(
        &self,
        token: FencingToken,
        now: DateTime<Utc>,
    ) -> Result<bool, CommitError> {
        let current = self.lock.current().await?;
        Ok(current.is_some_and(|lease| lease.token == token && !lease.is_expired(now)))
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<CommitOutcome, CommitError> {
        let Some(token) = self.leadership.borrow().token else {
            return Ok(CommitOutcome::Inactive);
        };

        let pending = list_pending(self.store.as_ref(), &self.location).await?;
        if pending.is_empty() {
            return Ok(CommitOutcome::Idle);
        }
        let candidates = self.verified_segments(&pending).await?;

        let mut attempt = 0;
        let (snapshot_id, added) = loop {
            let metadata = self.catalog.metadata().await?;
            let mut committed: HashSet<&str> =
                metadata.segments().iter().map(|s| s.path.as_str()).collect();
            let added: Vec<Segment> = candidates
                .iter()
                .filter(|s| committed.insert(s.path.as_str()))
                .cloned()
                .collect();

            if added.is_empty() {
                // a previous leader committed these but crashed before cleanup
                self.clear(&pending, &metadata_paths(metadata.segments())).await;
                return Ok(CommitOutcome::Idle);
            }

            if !self.still_leader(token) {
                self.stats.aborts += 1;
                tracing::warn!(token, "leadership lost mid-commit, aborting");
                return Ok(CommitOutcome::Aborted { token });
            }
            if !self.lease_confirmed(token, now).await? {
                self.stats.aborts += 1;
                tracing::warn!(token, "lease no longer held, aborting commit");
                return Ok(CommitOutcome::Aborted { token });
            }

            match self
                .catalog
                .append_snapshot(metadata.current_snapshot_id, added.clone(), token, now)
                .await
            {
                Ok(id) => break (id, added),
                Err(CatalogError::Conflict { expected, actual }) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    self.stats.conflicts += 1;
                    tracing::warn!(token, ?expected, ?actual, "catalog conflict, retrying on fresh state");
                }
                Err(CatalogError::StaleFencingToken { token, highest }) => {
                    self.stats.aborts += 1;
                    tracing::warn!(token, highest, "commit fenced off by newer leader");
                    return Ok(CommitOutcome::Fenced { token, highest });
                }
                Err(e) => {
                    if matches!(e, CatalogError::Conflict { .. }) {
                        self.stats.conflicts += 1;
                    }
                    return Err(e.into());
                }
            }
        };

        let rows = added.iter().map(|s| s.row_count).sum();
        self.stats.commits += 1;
        self.stats.segments_committed += added.len() as u64;
        self.stats.rows_committed += rows;

        let committed = metadata_paths(&candidates);
        self.clear(&pending, &committed).await;

        tracing::info!(
            token,
            snapshot_id,
            segments = added.len(),
            rows,
            "committed pending segments"
        );
        Ok(CommitOutcome::Committed {
            snapshot_id,
            segments: added.len(),
            rows,
        })
    }

    /// Pending segments whose data file is present, in discovery order.
    async fn verified_segments(
        &self,
        pending: &[PendingIndexEntry],
    ) -> Result<Vec<Segment>, CommitError> {
        let mut segments = Vec::with_capacity(pending.len());
        for entry in pending {
            match self.store.head(&entry.segment.path).await {
                Ok(meta) => {
                    if meta.size != entry.segment.byte_size {
                        tracing::warn!(
                            segment = %entry.segment.path,
                            indexed = entry.segment.byte_size,
                            actual = meta.size,
                            "segment size differs from index entry"
                        );
                    }
                    segments.push(entry.segment.clone());
                }
                Err(StorageError::NotFound(_)) => {
                    tracing::warn!(segment = %entry.segment.path, "pending entry without data file, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(segments)
    }

    /// Delete the pending entries for segments in `committed`.
    async fn clear(&self, pending: &[PendingIndexEntry], committed: &HashSet<String>) {
        for entry in pending.iter().filter(|e| committed.contains(&e.segment.path)) {
            let key = entry.key(&self.location);
            if let Err(e) = self.store.delete(&key).await {
                // next tick filters it against the committed set
                tracing::warn!(key = %key, error = %e, "failed to delete pending entry");
            }
        }
    }
}

fn metadata_paths(segments: &[Segment]) -> HashSet<String> {
    segments.iter().map(|s| s.path.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventBuffer, OverflowPolicy};
    use crate::catalog::{ObjectStoreCatalog, TableMetadata, TableSnapshot};
    use crate::lease::{ElectorState, InMemoryLock};
    use crate::record::fixtures::record;
    use crate::record::NodeId;
    use crate::segment::{SegmentWriter, SegmentWriterConfig};
    use crate::storage::InMemoryObjectStore;
    use async_trait::async_trait;

    fn location() -> TableLocation {
        TableLocation::new("minio", "api_logs")
    }

    fn leader(token: FencingToken) -> Leadership {
        Leadership {
            state: ElectorState::Leader,
            token: Some(token),
        }
    }

    async fn write_segments(store: &Arc<InMemoryObjectStore>, nodes: usize, per_node: usize) -> usize {
        let mut written = 0;
        for n in 0..nodes {
            let node = format!("n{n}");
            let buffer = Arc::new(EventBuffer::new(100, 100, OverflowPolicy::DropOldest));
            let mut writer = SegmentWriter::new(
                NodeId::new(node.clone()),
                location(),
                store.clone(),
                buffer,
                SegmentWriterConfig::default(),
            );
            for s in 0..per_node {
                for r in 0..3 {
                    writer.buffer().record(record(&node, (s * 10 + r) as u64));
                }
                written += writer.tick(Utc::now()).await.written.len();
            }
        }
        written
    }

    /// Lock whose live lease carries `token`, held by `n0`.
    async fn lease_at(token: FencingToken) -> Arc<InMemoryLock> {
        let lock = Arc::new(InMemoryLock::new());
        let node = NodeId::new("n0");
        for t in 1..=token {
            let lease = lock
                .acquire(&node, Utc::now(), std::time::Duration::from_secs(60))
                .await
                .unwrap();
            if t < token {
                lock.release(&lease, Utc::now()).await.unwrap();
            }
        }
        lock
    }

    async fn setup() -> (Arc<InMemoryObjectStore>, Arc<ObjectStoreCatalog>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let catalog = ObjectStoreCatalog::create_if_missing(store.clone(), location(), Utc::now())
            .await
            .unwrap();
        (store, Arc::new(catalog))
    }

    #[tokio::test]
    async fn follower_does_nothing() {
        let (store, catalog) = setup().await;
        write_segments(&store, 1, 1).await;
        let (_tx, rx) = watch::channel(Leadership::default());

        let lock = Arc::new(InMemoryLock::new());
        let mut coordinator = CommitCoordinator::new(store.clone(), location(), catalog.clone(), lock, rx);
        assert_eq!(coordinator.tick(Utc::now()).await.unwrap(), CommitOutcome::Inactive);
        assert!(catalog.current_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_merges_segments_from_all_nodes() {
        let (store, catalog) = setup().await;
        let written = write_segments(&store, 3, 2).await;
        assert_eq!(written, 6);
        let (_tx, rx) = watch::channel(leader(1));

        let mut coordinator =
            CommitCoordinator::new(store.clone(), location(), catalog.clone(), lease_at(1).await, rx);
        let outcome = coordinator.tick(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                snapshot_id: 1,
                segments: 6,
                rows: 18
            }
        );

        let snapshot = catalog.current_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.segments.len(), 6);
        assert!(list_pending(store.as_ref(), &location()).await.unwrap().is_empty());

        // nothing left: next tick is a no-op and writes no snapshot
        assert_eq!(coordinator.tick(Utc::now()).await.unwrap(), CommitOutcome::Idle);
        assert_eq!(catalog.versions().await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn leftover_entries_of_committed_segments_are_not_recommitted() {
        let (store, catalog) = setup().await;
        write_segments(&store, 1, 1).await;
        let pending = list_pending(store.as_ref(), &location()).await.unwrap();

        // previous leader committed but crashed before deleting the entry
        let segments = pending.iter().map(|e| e.segment.clone()).collect();
        catalog.append_snapshot(None, segments, 1, Utc::now()).await.unwrap();

        let (_tx, rx) = watch::channel(leader(2));
        let mut coordinator =
            CommitCoordinator::new(store.clone(), location(), catalog.clone(), lease_at(2).await, rx);
        assert_eq!(coordinator.tick(Utc::now()).await.unwrap(), CommitOutcome::Idle);

        assert!(list_pending(store.as_ref(), &location()).await.unwrap().is_empty());
        assert_eq!(catalog.versions().await.unwrap(), vec![0, 1]);
    }

    /// Catalog that demotes the local node as soon as the coordinator reads
    /// the current metadata, i.e. after pending entries were listed.
    struct DemotingCatalog {
        inner: Arc<ObjectStoreCatalog>,
        leadership: watch::Sender<Leadership>,
    }

    #[async_trait]
    impl TableCatalog for DemotingCatalog {
        async fn metadata(&self) -> Result<TableMetadata, CatalogError> {
            self.leadership.send_replace(Leadership::default());
            self.inner.metadata().await
        }

        async fn snapshot(&self, id: SnapshotId) -> Result<TableSnapshot, CatalogError> {
            self.inner.snapshot(id).await
        }

        async fn append_snapshot(
            &self,
            parent: Option<SnapshotId>,
            new_segments: Vec<Segment>,
            fencing_token: FencingToken,
            now: DateTime<Utc>,
        ) -> Result<SnapshotId, CatalogError> {
            self.inner
                .append_snapshot(parent, new_segments, fencing_token, now)
                .await
        }
    }

    #[tokio::test]
    async fn demotion_mid_commit_leaves_catalog_untouched() {
        let (store, catalog) = setup().await;
        write_segments(&store, 2, 1).await;

        let (tx, rx) = watch::channel(leader(3));
        let demoting = Arc::new(DemotingCatalog {
            inner: catalog.clone(),
            leadership: tx,
        });

        let mut coordinator =
            CommitCoordinator::new(store.clone(), location(), demoting, lease_at(3).await, rx);
        let outcome = coordinator.tick(Utc::now()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Aborted { token: 3 });
        assert_eq!(catalog.versions().await.unwrap(), vec![0]);
        assert_eq!(list_pending(store.as_ref(), &location()).await.unwrap().len(), 2);
        assert_eq!(coordinator.stats().aborts, 1);
    }

    #[tokio::test]
    async fn stale_leader_is_fenced() {
        let (store, catalog) = setup().await;
        catalog.append_snapshot(None, Vec::new(), 5, Utc::now()).await.unwrap();
        write_segments(&store, 1, 1).await;

        let (_tx, rx) = watch::channel(leader(4));
        let mut coordinator =
            CommitCoordinator::new(store.clone(), location(), catalog.clone(), lease_at(4).await, rx);

        assert_eq!(
            coordinator.tick(Utc::now()).await.unwrap(),
            CommitOutcome::Fenced {
                token: 4,
                highest: 5
            }
        );
        assert_eq!(list_pending(store.as_ref(), &location()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_entry_without_data_is_skipped() {
        let (store, catalog) = setup().await;
        write_segments(&store, 1, 2).await;
        let pending = list_pending(store.as_ref(), &location()).await.unwrap();
        store.delete(&pending[0].segment.path).await.unwrap();

        let (_tx, rx) = watch::channel(leader(1));
        let mut coordinator =
            CommitCoordinator::new(store.clone(), location(), catalog.clone(), lease_at(1).await, rx);
        let outcome = coordinator.tick(Utc::now()).await.unwrap();

        assert!(matches!(outcome, CommitOutcome::Committed { segments: 1, .. }));
        let remaining = list_pending(store.as_ref(), &location()).await.unwrap();
        assert_eq!(remaining, vec![pending[0].clone()]);
    }

    #[tokio::test]
    async fn superseded_leader_cannot_commit_before_its_elector_notices() {
        use chrono::TimeZone;
        let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let ttl = std::time::Duration::from_secs(10);

        let (store, catalog) = setup().await;
        write_segments(&store, 1, 1).await;

        let lock = Arc::new(InMemoryLock::new());
        let a = lock.acquire(&NodeId::new("a"), at(0), ttl).await.unwrap();
        let b = lock.acquire(&NodeId::new("b"), at(11), ttl).await.unwrap();
        assert_eq!((a.token, b.token), (1, 2));

        // a's elector has not ticked since t=0 and still publishes token 1
        let (_tx, rx) = watch::channel(leader(a.token));
        let mut coordinator = CommitCoordinator::new(store.clone(), location(), catalog.clone(), lock, rx);

        assert_eq!(coordinator.tick(at(12)).await.unwrap(), CommitOutcome::Aborted { token: 1 });
        assert_eq!(catalog.versions().await.unwrap(), vec![0]);
        assert_eq!(list_pending(store.as_ref(), &location()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_without_successor_cannot_commit() {
        use chrono::TimeZone;
        let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();

        let (store, catalog) = setup().await;
        write_segments(&store, 1, 1).await;

        let lock = Arc::new(InMemoryLock::new());
        let a = lock
            .acquire(&NodeId::new("a"), at(0), std::time::Duration::from_secs(10))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(leader(a.token));
        let mut coordinator = CommitCoordinator::new(store.clone(), location(), catalog.clone(), lock, rx);

        assert_eq!(coordinator.tick(at(10)).await.unwrap(), CommitOutcome::Aborted { token: 1 });
        assert_eq!(coordinator.stats().aborts, 1);
        assert_eq!(catalog.versions().await.unwrap(), vec![0]);
    }
}
