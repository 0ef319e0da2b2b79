// Warehouse Layout
//
// Key naming for everything a table owns inside the warehouse:
//
//   <ns>/<table>/data/<node>/<seq>-<uuid>.parquet
//   <ns>/<table>/metadata/v<version>.metadata.json
//   <ns>/<table>/metadata/version-hint.text
//   <ns>/<table>/.meta/pending/<node>/<seq>-<uuid>.json
//   <ns>/<table>/.meta/leader/<token>.<renewal>.json
//
// Numbers are zero-padded so lexicographic order equals numeric order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLocation {
    pub namespace: String,
    pub table: String,
}

impl TableLocation {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }

    pub fn root(&self) -> String {
        format!("{}/{}", self.namespace, self.table)
    }

    pub fn data_prefix(&self, node: &NodeId) -> String {
        format!("{}/data/{}/", self.root(), node)
    }

    pub fn data_key(&self, node: &NodeId, seq: u64, id: Uuid) -> String {
        format!("{}{seq:020}-{id}.parquet", self.data_prefix(node))
    }

    pub fn pending_prefix(&self) -> String {
        format!("{}/.meta/pending/", self.root())
    }

    pub fn node_pending_prefix(&self, node: &NodeId) -> String {
        format!("{}{}/", self.pending_prefix(), node)
    }

    pub fn pending_key(&self, node: &NodeId, seq: u64, id: Uuid) -> String {
        format!("{}{seq:020}-{id}.json", self.node_pending_prefix(node))
    }

    pub fn metadata_prefix(&self) -> String {
        format!("{}/metadata/", self.root())
    }

    pub fn metadata_key(&self, version: u64) -> String {
        format!("{}v{version:020}.metadata.json", self.metadata_prefix())
    }

    pub fn version_hint_key(&self) -> String {
        format!("{}version-hint.text", self.metadata_prefix())
    }

    pub fn leader_prefix(&self) -> String {
        format!("{}/.meta/leader/", self.root())
    }

    pub fn lease_key(&self, token: u64, renewal: u64) -> String {
        format!("{}{token:020}.{renewal:020}.json", self.leader_prefix())
    }
}

/// Extract the metadata version from a `v<version>.metadata.json` key.
pub fn parse_metadata_version(key: &str) -> Option<u64> {
    let name = key.rsplit('/').next()?;
    name.strip_prefix('v')?
        .strip_suffix(".metadata.json")?
        .parse()
        .ok()
}

/// Extract the writer sequence from a `<seq>-<uuid>.<ext>` key.
pub fn parse_sequence(key: &str) -> Option<u64> {
    let name = key.rsplit('/').next()?;
    name.split('-').next()?.parse().ok()
}

/// Extract `(token, renewal)` from a lease key.
pub fn parse_lease_key(key: &str) -> Option<(u64, u64)> {
    let name = key.rsplit('/').next()?.strip_suffix(".json")?;
    let (token, renewal) = name.split_once('.')?;
    Some((token.parse().ok()?, renewal.parse().ok()?))
}
