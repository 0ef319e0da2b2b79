// Segment Writer
//
// Turns drained buffer contents into immutable Parquet segments in the
// shared warehouse, then publishes a pending index entry per segment so the
// coordinator can discover it.
//
// Write order per batch is always: data file, then pending entry. A batch
// keeps its sequence number and file id across retries, so repeating a
// partially completed write converges on the same two objects.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::layout::{parse_sequence, TableLocation};
use crate::record::{LogRecord, NodeId};
use crate::storage::{ObjectStore, StorageError};

pub mod format;

pub use format::{decode_segment, encode_segment, read_footer, SegmentFooter, SCHEMA_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("segment footer key `{0}` missing")]
    MissingFooter(String),

    #[error("segment decode error: {0}")]
    Decode(String),
}

/// Immutable description of a written segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Segment {
    pub id: Uuid,
    pub path: String,
    pub node: NodeId,
    pub sequence: u64,
    pub row_count: u64,
    pub byte_size: u64,
    pub schema_version: i32,
    pub created_at: DateTime<Utc>,
}

/// Discovery pointer for a written but not yet committed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIndexEntry {
    pub segment: Segment,
}

impl PendingIndexEntry {
    pub fn key(&self, location: &TableLocation) -> String {
        location.pending_key(&self.segment.node, self.segment.sequence, self.segment.id)
    }
}

/// List every pending entry in the table, across all nodes.
pub async fn list_pending(
    store: &dyn ObjectStore,
    location: &TableLocation,
) -> Result<Vec<PendingIndexEntry>, SegmentError> {
    read_pending(store, &location.pending_prefix()).await
}

async fn read_pending(
    store: &dyn ObjectStore,
    prefix: &str,
) -> Result<Vec<PendingIndexEntry>, SegmentError> {
    let mut entries = Vec::new();
    for meta in store.list(prefix).await? {
        let data = match store.get(&meta.key).await {
            Ok(data) => data,
            // consumed by a commit between list and get
            Err(StorageError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        entries.push(serde_json::from_slice(&data)?);
    }
    Ok(entries)
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub segments_written: u64,
    pub rows_written: u64,
    pub write_failures: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
}

/// Outcome of a single writer tick.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub written: Vec<Segment>,
    pub failed: bool,
    pub backlog: usize,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub reindexed: Vec<Segment>,
    pub next_sequence: u64,
}

/// A drained batch that has not been fully published yet.
#[derive(Debug)]
struct PendingBatch {
    sequence: u64,
    id: Uuid,
    created_at: DateTime<Utc>,
    /// Emptied once the data file is durable.
    records: Vec<LogRecord>,
    /// Set once the data file is durable.
    written: Option<Segment>,
}

#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    /// Batches without a durable data file kept for retry before the
    /// oldest is dropped. Batches waiting only on their pending entry do
    /// not count.
    pub max_backlog_batches: usize,
}

impl Default for SegmentWriterConfig {
    fn default() -> Self {
        Self {
            max_backlog_batches: 8,
        }
    }
}

pub struct SegmentWriter {
    node: NodeId,
    location: TableLocation,
    store: Arc<dyn ObjectStore>,
    buffer: Arc<EventBuffer>,
    config: SegmentWriterConfig,
    next_sequence: u64,
    backlog: VecDeque<PendingBatch>,
    stats: WriterStats,
}

impl SegmentWriter {
    pub fn new(
        node: NodeId,
        location: TableLocation,
        store: Arc<dyn ObjectStore>,
        buffer: Arc<EventBuffer>,
        config: SegmentWriterConfig,
    ) -> Self {
        Self {
            node,
            location,
            store,
            buffer,
            config,
            next_sequence: 1,
            backlog: VecDeque::new(),
            stats: WriterStats::default(),
        }
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Records held only in memory: drained but with no durable data file.
    pub fn unwritten_rows(&self) -> u64 {
        self.backlog
            .iter()
            .filter(|b| b.written.is_none())
            .map(|b| b.records.len() as u64)
            .sum()
    }

    /// Re-index segments this node wrote but never published.
    ///
    /// `committed` holds the paths already referenced by the table. Must run
    /// before the first tick so sequence numbers continue after existing files.
    pub async fn recover(
        &mut self,
        committed: &HashSet<String>,
    ) -> Result<RecoveryReport, SegmentError> {
        let data_files = self.store.list(&self.location.data_prefix(&self.node)).await?;
        let pending: HashSet<String> = read_pending(
            self.store.as_ref(),
            &self.location.node_pending_prefix(&self.node),
        )
        .await?
        .into_iter()
        .map(|e| e.segment.path)
        .collect();

        let mut report = RecoveryReport::default();
        for meta in &data_files {
            if let Some(seq) = parse_sequence(&meta.key) {
                self.next_sequence = self.next_sequence.max(seq + 1);
            }
            if pending.contains(&meta.key) || committed.contains(&meta.key) {
                continue;
            }

            let Some(id) = segment_id(&meta.key) else {
                tracing::warn!(segment = %meta.key, "unrecognised file in data area, skipping");
                continue;
            };
            let footer = match read_footer(self.store.get(&meta.key).await?) {
                Ok(footer) => footer,
                Err(e) => {
                    tracing::warn!(segment = %meta.key, error = %e, "unreadable orphan segment, skipping");
                    continue;
                }
            };

            let entry = PendingIndexEntry {
                segment: Segment {
                    id,
                    path: meta.key.clone(),
                    node: self.node.clone(),
                    sequence: footer.sequence,
                    row_count: footer.row_count,
                    byte_size: meta.size,
                    schema_version: footer.schema_version,
                    created_at: footer.created_at,
                },
            };
            self.publish(&entry).await?;
            tracing::info!(
                node = %self.node,
                segment = %meta.key,
                rows = entry.segment.row_count,
                "re-indexed orphan segment"
            );
            report.reindexed.push(entry.segment);
        }

        report.next_sequence = self.next_sequence;
        Ok(report)
    }

    /// Flush everything currently buffered plus any backlog from earlier
    /// failed ticks.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> FlushReport {
        let records = self.buffer.drain();
        if !records.is_empty() {
            self.backlog.push_back(PendingBatch {
                sequence: self.next_sequence,
                id: Uuid::new_v4(),
                created_at: now,
                records,
                written: None,
            });
            self.next_sequence += 1;
        }

        let mut report = FlushReport::default();
        while let Some(batch) = self.backlog.front_mut() {
            match write_batch(self.store.as_ref(), &self.location, &self.node, batch).await {
                Ok(segment) => {
                    self.stats.segments_written += 1;
                    self.stats.rows_written += segment.row_count;
                    tracing::debug!(
                        node = %self.node,
                        segment = %segment.path,
                        rows = segment.row_count,
                        bytes = segment.byte_size,
                        "segment written"
                    );
                    report.written.push(segment);
                    self.backlog.pop_front();
                }
                Err(e) => {
                    let sequence = batch.sequence;
                    self.stats.write_failures += 1;
                    report.failed = true;
                    tracing::warn!(
                        node = %self.node,
                        sequence,
                        backlog = self.backlog.len(),
                        error = %e,
                        "segment write failed, will retry next tick"
                    );
                    break;
                }
            }
        }

        while self.backlog.iter().filter(|b| b.written.is_none()).count()
            > self.config.max_backlog_batches
        {
            let Some(oldest) = self.backlog.iter().position(|b| b.written.is_none()) else {
                break;
            };
            if let Some(dropped) = self.backlog.remove(oldest) {
                self.stats.batches_dropped += 1;
                self.stats.records_dropped += dropped.records.len() as u64;
                tracing::error!(
                    node = %self.node,
                    sequence = dropped.sequence,
                    records = dropped.records.len(),
                    "write backlog exceeded, dropping oldest batch"
                );
            }
        }

        report.backlog = self.backlog.len();
        report
    }

    async fn publish(&self, entry: &PendingIndexEntry) -> Result<(), SegmentError> {
        put_pending(self.store.as_ref(), &self.location, entry).await
    }
}

async fn put_pending(
    store: &dyn ObjectStore,
    location: &TableLocation,
    entry: &PendingIndexEntry,
) -> Result<(), SegmentError> {
    let body = Bytes::from(serde_json::to_vec(entry)?);
    match store.put_if_absent(&entry.key(location), body).await {
        Ok(()) | Err(StorageError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn write_batch(
    store: &dyn ObjectStore,
    location: &TableLocation,
    node: &NodeId,
    batch: &mut PendingBatch,
) -> Result<Segment, SegmentError> {
    let segment = match &batch.written {
        Some(segment) => segment.clone(),
        None => {
            let footer = SegmentFooter {
                schema_version: SCHEMA_VERSION,
                node: node.clone(),
                sequence: batch.sequence,
                row_count: batch.records.len() as u64,
                created_at: batch.created_at,
            };
            let data = encode_segment(&batch.records, &footer)?;
            let path = location.data_key(node, batch.sequence, batch.id);
            let byte_size = data.len() as u64;
            store.put(&path, data).await?;

            let segment = Segment {
                id: batch.id,
                path,
                node: node.clone(),
                sequence: batch.sequence,
                row_count: footer.row_count,
                byte_size,
                schema_version: SCHEMA_VERSION,
                created_at: batch.created_at,
            };
            batch.written = Some(segment.clone());
            batch.records = Vec::new();
            segment
        }
    };

    put_pending(store, location, &PendingIndexEntry { segment: segment.clone() }).await?;
    Ok(segment)
}

fn segment_id(key: &str) -> Option<Uuid> {
    let name = key.rsplit('/').next()?.strip_suffix(".parquet")?;
    let (_, id) = name.split_once('-')?;
    Uuid::parse_str(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverflowPolicy;
    use crate::record::fixtures::record;
    use crate::storage::{InMemoryObjectStore, ObjectMeta};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup(max_backlog: usize) -> (Arc<InMemoryObjectStore>, SegmentWriter) {
        let store = Arc::new(InMemoryObjectStore::new());
        let writer = writer_on(store.clone(), max_backlog);
        (store, writer)
    }

    fn writer_on(store: Arc<dyn ObjectStore>, max_backlog: usize) -> SegmentWriter {
        let buffer = Arc::new(EventBuffer::new(1_000, 1_000, OverflowPolicy::DropOldest));
        SegmentWriter::new(
            NodeId::new("n1"),
            TableLocation::new("minio", "api_logs"),
            store,
            buffer,
            SegmentWriterConfig {
                max_backlog_batches: max_backlog,
            },
        )
    }

    #[tokio::test]
    async fn empty_buffer_writes_nothing() {
        let (store, mut writer) = setup(4);

        let report = writer.tick(Utc::now()).await;

        assert!(report.written.is_empty());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn tick_writes_segment_then_pending_entry() {
        let (store, mut writer) = setup(4);
        for n in 0..3 {
            writer.buffer().record(record("n1", n));
        }

        let report = writer.tick(Utc::now()).await;
        assert_eq!(report.written.len(), 1);
        let segment = &report.written[0];
        assert_eq!(segment.row_count, 3);
        assert_eq!(segment.sequence, 1);

        let data = store.get(&segment.path).await.unwrap();
        assert_eq!(data.len() as u64, segment.byte_size);
        assert_eq!(decode_segment(data).unwrap().len(), 3);

        let location = TableLocation::new("minio", "api_logs");
        let pending = list_pending(store.as_ref(), &location).await.unwrap();
        assert_eq!(pending, vec![PendingIndexEntry { segment: segment.clone() }]);

        // second tick on an empty buffer is a no-op
        assert!(writer.tick(Utc::now()).await.written.is_empty());
    }

    #[tokio::test]
    async fn failed_write_is_retried_in_order() {
        let (store, mut writer) = setup(4);

        writer.buffer().record(record("n1", 1));
        store.set_unavailable(true);
        let report = writer.tick(Utc::now()).await;
        assert!(report.failed);
        assert_eq!(report.backlog, 1);

        writer.buffer().record(record("n1", 2));
        store.set_unavailable(false);
        let report = writer.tick(Utc::now()).await;

        let sequences: Vec<_> = report.written.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(writer.backlog_len(), 0);
        assert_eq!(writer.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn backlog_bound_drops_oldest_batch() {
        let (store, mut writer) = setup(2);
        store.set_unavailable(true);

        for n in 0..3 {
            writer.buffer().record(record("n1", n));
            writer.tick(Utc::now()).await;
        }

        assert_eq!(writer.backlog_len(), 2);
        assert_eq!(writer.stats().batches_dropped, 1);

        store.set_unavailable(false);
        let report = writer.tick(Utc::now()).await;
        let sequences: Vec<_> = report.written.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn recover_reindexes_orphaned_data_file() {
        let (store, mut writer) = setup(4);
        writer.buffer().record(record("n1", 1));
        let written = writer.tick(Utc::now()).await.written;
        let segment = written[0].clone();

        // simulate a crash between the data write and the pending entry
        let location = TableLocation::new("minio", "api_logs");
        store
            .delete(&PendingIndexEntry { segment: segment.clone() }.key(&location))
            .await
            .unwrap();

        let mut restarted = writer_on(store.clone(), 4);
        let report = restarted.recover(&HashSet::new()).await.unwrap();

        assert_eq!(report.reindexed.len(), 1);
        assert_eq!(report.reindexed[0].path, segment.path);
        assert_eq!(report.reindexed[0].row_count, 1);
        assert_eq!(report.next_sequence, 2);
        assert_eq!(list_pending(store.as_ref(), &location).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recover_skips_committed_segments() {
        let (store, mut writer) = setup(4);
        writer.buffer().record(record("n1", 1));
        let segment = writer.tick(Utc::now()).await.written[0].clone();

        let location = TableLocation::new("minio", "api_logs");
        store
            .delete(&PendingIndexEntry { segment: segment.clone() }.key(&location))
            .await
            .unwrap();

        let committed: HashSet<_> = [segment.path.clone()].into_iter().collect();
        let report = writer.recover(&committed).await.unwrap();
        assert!(report.reindexed.is_empty());
    }

    /// Data files land, pending entries fail while `index_down` is set.
    #[derive(Debug)]
    struct IndexDown {
        inner: Arc<InMemoryObjectStore>,
        index_down: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for IndexDown {
        async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            self.inner.put(key, data).await
        }

        async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            if self.index_down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable(key.to_string()));
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
    async fn durable_segments_are_exempt_from_backlog_bound() {
        let inner = Arc::new(InMemoryObjectStore::new());
        let store = Arc::new(IndexDown {
            inner: inner.clone(),
            index_down: AtomicBool::new(true),
        });
        let mut writer = writer_on(store.clone(), 1);

        for n in 0..2 {
            writer.buffer().record(record("n1", n));
            writer.tick(Utc::now()).await;
        }

        // batch 1 is on storage and waits for its entry, batch 2 is in memory
        assert_eq!(writer.backlog_len(), 2);
        assert_eq!(writer.unwritten_rows(), 1);
        assert_eq!(writer.stats().batches_dropped, 0);
        assert_eq!(writer.stats().records_dropped, 0);

        store.index_down.store(false, Ordering::SeqCst);
        let report = writer.tick(Utc::now()).await;
        let sequences: Vec<_> = report.written.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);

        let location = TableLocation::new("minio", "api_logs");
        let data_files = inner.keys().iter().filter(|k| k.ends_with(".parquet")).count();
        let pending = list_pending(inner.as_ref(), &location).await.unwrap();
        assert_eq!(data_files, 2);
        assert_eq!(pending.len(), data_files);
    }
}
