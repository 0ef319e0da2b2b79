// Table Metadata
//
// Iceberg-flavoured metadata document. One immutable document is written
// per version; version N carries snapshot N as its current snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SnapshotId, SnapshotSummary, TableSnapshot};
use crate::lease::FencingToken;
use crate::segment::format::{COLUMNS, SCHEMA_VERSION};
use crate::segment::Segment;

pub const FORMAT_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaField {
    pub id: i32,
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableSchema {
    pub schema_id: i32,
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    /// Schema matching the columns segment files are written with.
    pub fn api_log() -> Self {
        Self {
            schema_id: SCHEMA_VERSION,
            fields: COLUMNS
                .iter()
                .zip(1..)
                .map(|((name, kind, nullable), id)| SchemaField {
                    id,
                    name: (*name).to_string(),
                    required: !nullable,
                    field_type: (*kind).to_string(),
                })
                .collect(),
        }
    }
}

/// Partition spec. The table is unpartitioned, so `fields` stays empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    pub spec_id: i32,
    pub fields: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub snapshot_id: SnapshotId,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: u8,
    pub table_uuid: Uuid,
    pub location: String,
    /// Metadata version this document was written as.
    pub version: u64,
    pub last_updated_ms: i64,
    pub current_schema_id: i32,
    pub schemas: Vec<TableSchema>,
    pub default_spec_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    pub current_snapshot_id: Option<SnapshotId>,
    pub current_snapshot: Option<TableSnapshot>,
    pub snapshot_log: Vec<SnapshotLogEntry>,
    /// Highest fencing token that ever committed to this table.
    pub max_fencing_token: FencingToken,
}

impl TableMetadata {
    /// Version 0: a table with no snapshots.
    pub fn create(location: String, now: DateTime<Utc>) -> Self {
        let schema = TableSchema::api_log();
        Self {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location,
            version: 0,
            last_updated_ms: now.timestamp_millis(),
            current_schema_id: schema.schema_id,
            schemas: vec![schema],
            default_spec_id: 0,
            partition_specs: vec![PartitionSpec {
                spec_id: 0,
                fields: Vec::new(),
            }],
            current_snapshot_id: None,
            current_snapshot: None,
            snapshot_log: Vec::new(),
            max_fencing_token: 0,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        self.current_snapshot
            .as_ref()
            .map(|s| s.segments.as_slice())
            .unwrap_or_default()
    }

    /// Build the next version with `added` appended to the current segments.
    pub fn with_appended(
        &self,
        added: Vec<Segment>,
        fencing_token: FencingToken,
        now: DateTime<Utc>,
    ) -> Self {
        let snapshot_id = self.version + 1;
        let added_rows = added.iter().map(|s| s.row_count).sum();
        let added_files = added.len() as u64;

        let mut segments = self.segments().to_vec();
        segments.extend(added);
        let summary = SnapshotSummary {
            added_files,
            added_rows,
            total_files: segments.len() as u64,
            total_rows: segments.iter().map(|s| s.row_count).sum(),
            total_bytes: segments.iter().map(|s| s.byte_size).sum(),
        };

        let snapshot = TableSnapshot {
            snapshot_id,
            parent_snapshot_id: self.current_snapshot_id,
            timestamp_ms: now.timestamp_millis(),
            fencing_token,
            summary,
            segments,
        };

        let mut snapshot_log = self.snapshot_log.clone();
        snapshot_log.push(SnapshotLogEntry {
            snapshot_id,
            timestamp_ms: snapshot.timestamp_ms,
        });

        Self {
            version: snapshot_id,
            last_updated_ms: snapshot.timestamp_ms,
            current_snapshot_id: Some(snapshot_id),
            current_snapshot: Some(snapshot),
            snapshot_log,
            max_fencing_token: self.max_fencing_token.max(fencing_token),
            ..self.clone()
        }
    }
}
