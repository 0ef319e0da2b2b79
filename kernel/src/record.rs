// API Log Records
//
// One observation of a completed API operation, as produced by the
// request-handling layer of a storage node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a writer node in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single API access-log entry.
///
/// Field names on the wire follow the column names of the table
/// (`time`, `name`, `httpStatusCode`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    /// Operation name, e.g. `PutObject`.
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub object: String,
    pub http_status_code: u16,
    #[serde(default)]
    pub input_bytes: u64,
    #[serde(default)]
    pub output_bytes: u64,
    /// Total request duration in nanoseconds.
    #[serde(default)]
    pub duration_ns: u64,
    /// Time to first byte in nanoseconds, when the response streamed a body.
    #[serde(default)]
    pub time_to_first_byte_ns: Option<u64>,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub access_key: String,
    pub request_id: String,
    /// Empty when the producer leaves it to the ingesting node.
    #[serde(default)]
    pub node: NodeId,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_json_line() {
        let json = r#"{
            "time": "2024-01-01T00:00:00Z",
            "name": "PutObject",
            "bucket": "test-bucket",
            "object": "file-1.txt",
            "httpStatusCode": 200,
            "durationNs": 1200,
            "requestId": "17A",
            "node": "minio1"
        }"#;

        let record: LogRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.name, "PutObject");
        assert_eq!(record.http_status_code, 200);
        assert_eq!(record.time_to_first_byte_ns, None);
        assert_eq!(record.node, NodeId::new("minio1"));
    }
}
