// Table Catalog
//
// Versioned table state. Snapshots only ever get appended, and appending is
// a compare-and-swap on the parent snapshot id: a writer that built its
// snapshot on stale state gets `Conflict` instead of overwriting history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invariants::InvariantViolation;
use crate::lease::FencingToken;
use crate::segment::Segment;
use crate::storage::StorageError;

pub mod metadata;
pub mod store;

pub use metadata::TableMetadata;
pub use store::ObjectStoreCatalog;

/// Identifier of a committed snapshot. Strictly increasing.
pub type SnapshotId = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotSummary {
    pub added_files: u64,
    pub added_rows: u64,
    pub total_files: u64,
    pub total_rows: u64,
    pub total_bytes: u64,
}

/// Immutable view of the committed segment set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableSnapshot {
    pub snapshot_id: SnapshotId,
    pub parent_snapshot_id: Option<SnapshotId>,
    pub timestamp_ms: i64,
    /// Token of the leader that committed this snapshot.
    pub fencing_token: FencingToken,
    pub summary: SnapshotSummary,
    pub segments: Vec<Segment>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("snapshot conflict: expected parent {expected:?}, current is {actual:?}")]
    Conflict {
        expected: Option<SnapshotId>,
        actual: Option<SnapshotId>,
    },

    #[error("fencing token {token} is older than {highest}")]
    StaleFencingToken {
        token: FencingToken,
        highest: FencingToken,
    },

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    #[error("table {0} does not exist")]
    TableNotFound(String),

    #[error("{0}")]
    Invariant(#[from] InvariantViolation),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Latest metadata document.
    async fn metadata(&self) -> Result<TableMetadata, CatalogError>;

    async fn current_snapshot(&self) -> Result<Option<TableSnapshot>, CatalogError> {
        Ok(self.metadata().await?.current_snapshot)
    }

    /// A historical snapshot.
    async fn snapshot(&self, id: SnapshotId) -> Result<TableSnapshot, CatalogError>;

    /// Commit `new_segments` on top of snapshot `parent`.
    ///
    /// Fails with `Conflict` unless `parent` is still the current snapshot,
    /// and with `StaleFencingToken` if a newer leader already committed.
    async fn append_snapshot(
        &self,
        parent: Option<SnapshotId>,
        new_segments: Vec<Segment>,
        fencing_token: FencingToken,
        now: DateTime<Utc>,
    ) -> Result<SnapshotId, CatalogError>;
}
