// Object-storage catalog.
//
// Metadata version N lives at `metadata/v<N>.metadata.json` and is created
// with `put_if_absent`, so of several writers building on the same parent
// exactly one can publish N. The highest existing version is current.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{CatalogError, SnapshotId, TableCatalog, TableMetadata, TableSnapshot};
use crate::invariants::InvariantEngine;
use crate::layout::{parse_metadata_version, TableLocation};
use crate::lease::FencingToken;
use crate::segment::Segment;
use crate::storage::{ObjectStore, StorageError};

pub struct ObjectStoreCatalog {
    store: Arc<dyn ObjectStore>,
    location: TableLocation,
    invariants: InvariantEngine,
}

impl ObjectStoreCatalog {
    /// Open the table, creating version 0 if nothing exists yet.
    pub async fn create_if_missing(
        store: Arc<dyn ObjectStore>,
        location: TableLocation,
        now: DateTime<Utc>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self {
            store,
            location,
            invariants: InvariantEngine::standard(),
        };

        if catalog.latest_version().await?.is_none() {
            let metadata = TableMetadata::create(catalog.location.root(), now);
            match catalog.publish(&metadata).await {
                Ok(()) => tracing::info!(table = %catalog.location.root(), "created table"),
                // another node created it first
                Err(CatalogError::Storage(StorageError::AlreadyExists(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(catalog)
    }

    /// Open an existing table.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        location: TableLocation,
    ) -> Result<Self, CatalogError> {
        let catalog = Self {
            store,
            location,
            invariants: InvariantEngine::standard(),
        };
        if catalog.latest_version().await?.is_none() {
            return Err(CatalogError::TableNotFound(catalog.location.root()));
        }
        Ok(catalog)
    }

    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn invariants(&self) -> &InvariantEngine {
        &self.invariants
    }

    /// All metadata versions present, ascending.
    pub async fn versions(&self) -> Result<Vec<u64>, CatalogError> {
        let mut versions: Vec<u64> = self
            .store
            .list(&self.location.metadata_prefix())
            .await?
            .iter()
            .filter_map(|m| parse_metadata_version(&m.key))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn latest_version(&self) -> Result<Option<u64>, CatalogError> {
        Ok(self.versions().await?.pop())
    }

    pub async fn metadata_at(&self, version: u64) -> Result<TableMetadata, CatalogError> {
        let data = self.store.get(&self.location.metadata_key(version)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn publish(&self, metadata: &TableMetadata) -> Result<(), CatalogError> {
        let body = Bytes::from(serde_json::to_vec_pretty(metadata)?);
        self.store
            .put_if_absent(&self.location.metadata_key(metadata.version), body)
            .await?;

        // readers use the hint as a shortcut; listing stays authoritative
        let hint = Bytes::from(metadata.version.to_string());
        if let Err(e) = self.store.put(&self.location.version_hint_key(), hint).await {
            tracing::debug!(error = %e, "version hint update failed");
        }
        Ok(())
    }
}

#[async_trait]
impl TableCatalog for ObjectStoreCatalog {
    async fn metadata(&self) -> Result<TableMetadata, CatalogError> {
        let version = self
            .latest_version()
            .await?
            .ok_or_else(|| CatalogError::TableNotFound(self.location.root()))?;
        self.metadata_at(version).await
    }

    async fn snapshot(&self, id: SnapshotId) -> Result<TableSnapshot, CatalogError> {
        match self.metadata_at(id).await {
            Ok(metadata) => metadata
                .current_snapshot
                .ok_or(CatalogError::SnapshotNotFound(id)),
            Err(CatalogError::Storage(StorageError::NotFound(_))) => {
                Err(CatalogError::SnapshotNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    async fn append_snapshot(
        &self,
        parent: Option<SnapshotId>,
        new_segments: Vec<Segment>,
        fencing_token: FencingToken,
        now: DateTime<Utc>,
    ) -> Result<SnapshotId, CatalogError> {
        let current = self.metadata().await?;
        if current.current_snapshot_id != parent {
            return Err(CatalogError::Conflict {
                expected: parent,
                actual: current.current_snapshot_id,
            });
        }
        if fencing_token < current.max_fencing_token {
            return Err(CatalogError::StaleFencingToken {
                token: fencing_token,
                highest: current.max_fencing_token,
            });
        }

        let next = current.with_appended(new_segments, fencing_token, now);
        self.invariants.evaluate(&current, &next)?;

        match self.publish(&next).await {
            Ok(()) => {}
            Err(CatalogError::Storage(StorageError::AlreadyExists(_))) => {
                return Err(CatalogError::Conflict {
                    expected: parent,
                    actual: Some(next.version),
                })
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            table = %self.location.root(),
            snapshot_id = next.version,
            token = fencing_token,
            "snapshot committed"
        );
        Ok(next.version)
    }
}
