// History Replay
//
// Walks every stored metadata version from 0 to the current one and
// re-checks each transition with the invariant engine. Used by
// `apilog inspect` to audit a table written by many nodes over time.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{CatalogError, ObjectStoreCatalog, SnapshotId};
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::lease::FencingToken;
use crate::storage::StorageError;

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("metadata history has a gap: expected version {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error("table has no metadata")]
    Empty,
}

/// Commits made under one fencing token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TermSummary {
    pub commits: u64,
    pub segments: u64,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub table_uuid: Uuid,
    pub location: String,
    pub versions: u64,
    pub current_snapshot_id: Option<SnapshotId>,
    pub total_segments: u64,
    pub total_rows: u64,
    pub total_bytes: u64,
    /// Per leader term, keyed by fencing token.
    pub terms: BTreeMap<FencingToken, TermSummary>,
    /// Committed segments whose data file is gone.
    pub missing_files: Vec<String>,
}

/// Replay the full history of a table.
pub async fn replay_history(catalog: &ObjectStoreCatalog) -> Result<HistoryReport, ReplayError> {
    replay_with(catalog, catalog.invariants()).await
}

/// Replay with a caller-provided rule set.
pub async fn replay_with(
    catalog: &ObjectStoreCatalog,
    invariants: &InvariantEngine,
) -> Result<HistoryReport, ReplayError> {
    let versions = catalog.versions().await?;
    let Some(&first) = versions.first() else {
        return Err(ReplayError::Empty);
    };
    if first != 0 {
        return Err(ReplayError::Gap {
            expected: 0,
            found: first,
        });
    }

    let mut terms: BTreeMap<FencingToken, TermSummary> = BTreeMap::new();
    let mut current = catalog.metadata_at(0).await?;

    for (expected, &version) in (1u64..).zip(versions.iter().skip(1)) {
        if version != expected {
            return Err(ReplayError::Gap {
                expected,
                found: version,
            });
        }
        let next = catalog.metadata_at(version).await?;
        invariants.evaluate(&current, &next)?;

        if let Some(snapshot) = &next.current_snapshot {
            let term = terms.entry(snapshot.fencing_token).or_default();
            term.commits += 1;
            term.segments += snapshot.summary.added_files;
            term.rows += snapshot.summary.added_rows;
        }
        current = next;
    }

    let mut missing_files = Vec::new();
    for segment in current.segments() {
        match catalog.store().head(&segment.path).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) => missing_files.push(segment.path.clone()),
            Err(e) => return Err(CatalogError::from(e).into()),
        }
    }
    if !missing_files.is_empty() {
        tracing::warn!(count = missing_files.len(), "committed segments missing on storage");
    }

    let summary = current
        .current_snapshot
        .as_ref()
        .map(|s| s.summary.clone())
        .unwrap_or_default();

    Ok(HistoryReport {
        table_uuid: current.table_uuid,
        location: current.location.clone(),
        versions: current.version + 1,
        current_snapshot_id: current.current_snapshot_id,
        total_segments: summary.total_files,
        total_rows: summary.total_rows,
        total_bytes: summary.total_bytes,
        terms,
        missing_files,
    })
}
