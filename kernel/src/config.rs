// Node Configuration
//
// Everything a writer node needs to know, with the defaults the cluster
// ships with. Loaded from JSON; the CLI layers flags and environment on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::OverflowPolicy;
use crate::layout::TableLocation;
use crate::record::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    pub node_id: String,
    pub warehouse: PathBuf,
    pub namespace: String,
    pub table: String,
    pub write_interval_ms: u64,
    pub commit_interval_ms: u64,
    pub lease_ttl_ms: u64,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_backlog_batches: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".into(),
            warehouse: PathBuf::from("api-logs"),
            namespace: "minio".into(),
            table: "api_logs".into(),
            write_interval_ms: 30_000,
            commit_interval_ms: 60_000,
            lease_ttl_ms: 10_000,
            batch_size: 1_000,
            buffer_capacity: 100_000,
            overflow_policy: OverflowPolicy::DropOldest,
            max_backlog_batches: 8,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let path_safe = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && s != "."
                && s != ".."
        };

        for (field, value) in [
            ("node-id", &self.node_id),
            ("namespace", &self.namespace),
            ("table", &self.table),
        ] {
            if !path_safe(value.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "{field} `{value}` must be non-empty and use only [A-Za-z0-9._-]"
                )));
            }
        }

        for (field, value) in [
            ("write-interval-ms", self.write_interval_ms),
            ("commit-interval-ms", self.commit_interval_ms),
            ("lease-ttl-ms", self.lease_ttl_ms),
            ("batch-size", self.batch_size as u64),
            ("buffer-capacity", self.buffer_capacity as u64),
            ("max-backlog-batches", self.max_backlog_batches as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }

        if self.lease_ttl_ms >= self.commit_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "lease-ttl-ms ({}) must be shorter than commit-interval-ms ({})",
                self.lease_ttl_ms, self.commit_interval_ms
            )));
        }
        Ok(())
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn location(&self) -> TableLocation {
        TableLocation::new(self.namespace.clone(), self.table.clone())
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Elector cadence: several renewals fit into one lease term.
    pub fn election_interval(&self) -> Duration {
        self.lease_ttl() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.write_interval(), Duration::from_secs(30));
        assert_eq!(config.commit_interval(), Duration::from_secs(60));
        assert_eq!(config.batch_size, 1_000);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "node-id": "minio2", "batch-size": 50 }"#).unwrap();
        assert_eq!(config.node_id, "minio2");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.table, "api_logs");
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn lease_must_be_shorter_than_commit_interval() {
        let config = NodeConfig {
            lease_ttl_ms: 60_000,
            ..NodeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease-ttl-ms"));
    }

    #[test]
    fn zero_backlog_is_rejected() {
        let config = NodeConfig {
            max_backlog_batches: 0,
            ..NodeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max-backlog-batches"));
    }

    #[test]
    fn path_unsafe_node_id_is_rejected() {
        let config = NodeConfig {
            node_id: "../escape".into(),
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "namespace": "logs", "overflow-policy": "drop-newest" }"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.namespace, "logs");
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert!(matches!(
            NodeConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
