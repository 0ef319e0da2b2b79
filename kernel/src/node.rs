// Node Runtime
//
// Wires one node's periodic activities onto tokio tasks:
//
//   writer       write-interval timer, or early when the buffer fills up
//   elector      lease renewal / contention, a few times per lease term
//   coordinator  commit-interval timer, acts only while leader
//
// Shutdown cancels all three. The writer always completes one final flush
// so that nothing drained is left unwritten.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferStats, EventBuffer};
use crate::catalog::{CatalogError, ObjectStoreCatalog, TableCatalog};
use crate::config::{ConfigError, NodeConfig};
use crate::coordinator::{CommitCoordinator, CoordinatorStats};
use crate::lease::{LeaderElector, LeaseLock, Leadership};
use crate::segment::{SegmentError, SegmentWriter, SegmentWriterConfig, WriterStats};
use crate::storage::ObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("segment recovery failed: {0}")]
    Recovery(#[from] SegmentError),

    #[error("node task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Final counters of a stopped node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub buffer: BufferStats,
    pub writer: WriterStats,
    pub coordinator: CoordinatorStats,
}

pub struct Node {
    config: NodeConfig,
    buffer: Arc<EventBuffer>,
    leadership: watch::Receiver<Leadership>,
    cancel: CancellationToken,
    writer: JoinHandle<WriterStats>,
    elector: JoinHandle<()>,
    coordinator: JoinHandle<CoordinatorStats>,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Node {
    /// Recover local state and start the node's tasks.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn LeaseLock>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node = config.node();
        let location = config.location();

        let catalog: Arc<dyn TableCatalog> = Arc::new(
            ObjectStoreCatalog::create_if_missing(store.clone(), location.clone(), Utc::now())
                .await?,
        );

        let buffer = Arc::new(EventBuffer::new(
            config.buffer_capacity,
            config.batch_size,
            config.overflow_policy,
        ));
        let mut writer = SegmentWriter::new(
            node.clone(),
            location.clone(),
            store.clone(),
            buffer.clone(),
            SegmentWriterConfig {
                max_backlog_batches: config.max_backlog_batches,
            },
        );
        let committed: HashSet<String> = catalog
            .metadata()
            .await?
            .segments()
            .iter()
            .map(|s| s.path.clone())
            .collect();
        let recovery = writer.recover(&committed).await?;
        tracing::info!(
            node = %node,
            reindexed = recovery.reindexed.len(),
            next_sequence = recovery.next_sequence,
            "node recovered"
        );

        let mut elector = LeaderElector::new(node.clone(), lock.clone(), config.lease_ttl());
        let leadership = elector.subscribe();
        let mut coordinator =
            CommitCoordinator::new(store, location, catalog, lock, elector.subscribe());
        let cancel = CancellationToken::new();

        let writer = {
            let cancel = cancel.clone();
            let buffer = buffer.clone();
            let mut timer = ticker(config.write_interval());
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {}
                        _ = buffer.flush_requested() => {}
                    }
                    writer.tick(Utc::now()).await;
                }
                let report = writer.tick(Utc::now()).await;
                if report.backlog > 0 {
                    tracing::error!(
                        batches = report.backlog,
                        "shutting down with unwritten batches"
                    );
                }
                writer.stats()
            })
        };

        let elector_task = {
            let cancel = cancel.clone();
            let mut timer = ticker(config.election_interval());
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {}
                    }
                    elector.tick(Utc::now()).await;
                }
                elector.step_down(Utc::now()).await;
            })
        };

        let coordinator_task = {
            let cancel = cancel.clone();
            let mut timer = ticker(config.commit_interval());
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {}
                    }
                    if let Err(e) = coordinator.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "commit failed, will retry next tick");
                    }
                }
                coordinator.stats()
            })
        };

        tracing::info!(node = %node, table = %config.location().root(), "node started");
        Ok(Self {
            config,
            buffer,
            leadership,
            cancel,
            writer,
            elector: elector_task,
            coordinator: coordinator_task,
        })
    }

    /// Handle for the request path.
    pub fn buffer(&self) -> Arc<EventBuffer> {
        self.buffer.clone()
    }

    pub fn leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stop all tasks, flushing the buffer one last time.
    pub async fn shutdown(self) -> Result<NodeReport, NodeError> {
        self.cancel.cancel();
        let coordinator = self.coordinator.await?;
        let writer = self.writer.await?;
        self.elector.await?;

        tracing::info!(node = %self.config.node_id, "node stopped");
        Ok(NodeReport {
            node: self.config.node_id,
            buffer: self.buffer.stats(),
            writer,
            coordinator,
        })
    }
}
