// In-Process Cluster Simulation
//
// Drives several nodes against one shared warehouse on a logical clock:
// every round each live node records synthetic API traffic, ticks its
// elector and writer, and every few rounds its coordinator. Faults are
// injected at fixed rounds (leader crash, storage write outage). After a
// drain phase the committed table is read back and checked for loss and
// duplication.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::buffer::{EventBuffer, OverflowPolicy};
use crate::catalog::{CatalogError, ObjectStoreCatalog, TableCatalog};
use crate::coordinator::{CommitCoordinator, CommitOutcome};
use crate::layout::TableLocation;
use crate::lease::{ElectorState, FencingToken, LeaderElector, LeaseLock, ObjectStoreLock};
use crate::record::{LogRecord, NodeId};
use crate::replay::{replay_history, ReplayError};
use crate::segment::{decode_segment, list_pending, SegmentError, SegmentWriter, SegmentWriterConfig};
use crate::storage::{ObjectMeta, ObjectStore, StorageError};

/// Operation mix of the synthetic traffic, with relative weights.
const OPERATIONS: &[(&str, u32)] = &[
    ("GetObject", 45),
    ("PutObject", 30),
    ("HeadObject", 10),
    ("ListObjectsV2", 10),
    ("DeleteObject", 5),
];

/// Upper bound on drain rounds after traffic stops.
const MAX_DRAIN_ROUNDS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimulationConfig {
    pub nodes: usize,
    pub rounds: u64,
    /// Logical time per round; every round is one write interval.
    pub round_ms: u64,
    /// Coordinators run every this many rounds.
    pub commit_every: u64,
    pub lease_ttl_ms: u64,
    pub events_per_round: usize,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub max_backlog_batches: usize,
    /// Round at which the current leader crashes and restarts.
    pub crash_leader_at: Option<u64>,
    /// Rounds `[start, end)` during which every storage write fails.
    pub outage: Option<(u64, u64)>,
    pub seed: u64,
    pub namespace: String,
    pub table: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            rounds: 30,
            round_ms: 1_000,
            commit_every: 2,
            lease_ttl_ms: 1_500,
            events_per_round: 20,
            batch_size: 1_000,
            buffer_capacity: 100_000,
            max_backlog_batches: 8,
            crash_leader_at: None,
            outage: None,
            seed: 7,
            namespace: "minio".into(),
            table: "api_logs".into(),
        }
    }
}

/// Errors that can occur during simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid simulation: {0}")]
    Invalid(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("committed history is invalid: {0}")]
    Replay(#[from] ReplayError),
}

/// Outcome of a full simulation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationResult {
    pub rounds: u64,
    pub drain_rounds: u64,
    pub recorded: u64,
    /// Dropped by buffer overflow or backlog eviction.
    pub dropped: u64,
    /// Lost in node crashes before reaching storage.
    pub lost_in_crash: u64,
    pub committed_rows: u64,
    pub committed_segments: u64,
    pub duplicate_records: u64,
    pub snapshots: u64,
    pub commits: u64,
    pub aborts: u64,
    pub conflicts: u64,
    pub leader_tokens: BTreeSet<FencingToken>,
    pub pending_left: u64,
}

impl SimulationResult {
    /// Every record that was not knowingly dropped is in the table, once.
    pub fn is_consistent(&self) -> bool {
        self.duplicate_records == 0
            && self.pending_left == 0
            && self.committed_rows + self.dropped + self.lost_in_crash == self.recorded
    }
}

/// Object store wrapper that refuses writes while switched off.
#[derive(Debug)]
struct FaultInjector {
    inner: Arc<dyn ObjectStore>,
    down: AtomicBool,
}

impl FaultInjector {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self, key: &str) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("injected outage on {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FaultInjector {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.check(key)?;
        self.inner.put(key, data).await
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.check(key)?;
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
        self.check(key)?;
        self.inner.delete(key).await
    }
}

struct SimNode {
    id: NodeId,
    buffer: Arc<EventBuffer>,
    writer: SegmentWriter,
    elector: LeaderElector,
    coordinator: CommitCoordinator,
}

struct Cluster {
    config: SimulationConfig,
    store: Arc<FaultInjector>,
    location: TableLocation,
    nodes: Vec<SimNode>,
    rng: StdRng,
    result: SimulationResult,
}

impl Cluster {
    async fn boot(&self, id: NodeId, now: DateTime<Utc>) -> Result<SimNode, SimulationError> {
        let store: Arc<dyn ObjectStore> = self.store.clone();
        let catalog =
            ObjectStoreCatalog::create_if_missing(store.clone(), self.location.clone(), now).await?;
        let committed: HashSet<String> = catalog
            .metadata()
            .await?
            .segments()
            .iter()
            .map(|s| s.path.clone())
            .collect();

        let buffer = Arc::new(EventBuffer::new(
            self.config.buffer_capacity,
            self.config.batch_size,
            OverflowPolicy::DropOldest,
        ));
        let mut writer = SegmentWriter::new(
            id.clone(),
            self.location.clone(),
            store.clone(),
            buffer.clone(),
            SegmentWriterConfig {
                max_backlog_batches: self.config.max_backlog_batches,
            },
        );
        writer.recover(&committed).await?;

        let lock: Arc<dyn LeaseLock> =
            Arc::new(ObjectStoreLock::new(store.clone(), self.location.clone()));
        let elector = LeaderElector::new(
            id.clone(),
            lock.clone(),
            Duration::from_millis(self.config.lease_ttl_ms),
        );
        let coordinator = CommitCoordinator::new(
            store,
            self.location.clone(),
            Arc::new(catalog),
            lock,
            elector.subscribe(),
        );

        Ok(SimNode {
            id,
            buffer,
            writer,
            elector,
            coordinator,
        })
    }

    fn traffic(&mut self, node: usize, round: u64, now: DateTime<Utc>) {
        let total: u32 = OPERATIONS.iter().map(|(_, w)| w).sum();
        let id = self.nodes[node].id.clone();

        for i in 0..self.config.events_per_round {
            let mut pick = self.rng.gen_range(0..total);
            let name = OPERATIONS
                .iter()
                .find(|(_, weight)| {
                    if pick < *weight {
                        true
                    } else {
                        pick -= weight;
                        false
                    }
                })
                .map(|(name, _)| *name)
                .unwrap_or("GetObject");

            let status = if self.rng.gen_bool(0.05) { 404 } else { 200 };
            let size = self.rng.gen_range(0..1_048_576u64);
            let (input_bytes, output_bytes) = match name {
                "PutObject" => (size, 0),
                "GetObject" if status == 200 => (0, size),
                _ => (0, 0),
            };
            let duration_ns = self.rng.gen_range(100_000..50_000_000u64);

            let record = LogRecord {
                time: now + chrono::Duration::milliseconds(i as i64),
                name: name.into(),
                bucket: format!("bucket-{}", self.rng.gen_range(0..4)),
                object: format!("objects/{}.bin", self.rng.gen_range(0..10_000)),
                http_status_code: status,
                input_bytes,
                output_bytes,
                duration_ns,
                time_to_first_byte_ns: (name == "GetObject" && status == 200)
                    .then(|| duration_ns / 4),
                remote_host: format!("10.0.{}.{}", node, self.rng.gen_range(1..255)),
                user_agent: "apilog-sim/1.0".into(),
                access_key: "simulation".into(),
                request_id: format!("{id}-{round:06}-{i:04}"),
                node: id.clone(),
            };
            self.nodes[node].buffer.record(record);
            self.result.recorded += 1;
        }
    }

    async fn step(&mut self, round: u64, now: DateTime<Utc>, commit: bool) {
        for node in &mut self.nodes {
            node.elector.tick(now).await;
        }
        for node in &mut self.nodes {
            node.writer.tick(now).await;
        }
        if !commit {
            return;
        }
        for node in &mut self.nodes {
            match node.coordinator.tick(now).await {
                Ok(CommitOutcome::Committed { snapshot_id, .. }) => {
                    tracing::debug!(round, node = %node.id, snapshot_id, "round committed");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(round, node = %node.id, error = %e, "commit failed"),
            }
        }
    }

    /// Kill the current leader without a graceful step-down and boot it again.
    async fn crash_leader(&mut self, now: DateTime<Utc>) -> Result<(), SimulationError> {
        let Some(index) = self
            .nodes
            .iter()
            .position(|n| n.elector.state() == ElectorState::Leader)
        else {
            tracing::warn!("no leader to crash");
            return Ok(());
        };

        let crashed = self.nodes.remove(index);
        let stats = crashed.writer.stats();
        let lost = crashed.buffer.len() as u64 + crashed.writer.unwritten_rows();
        self.absorb(&crashed);
        self.result.lost_in_crash += lost;
        tracing::info!(node = %crashed.id, lost, segments = stats.segments_written, "leader crashed");

        let restarted = self.boot(crashed.id.clone(), now).await?;
        self.nodes.insert(index, restarted);
        Ok(())
    }

    /// Fold a node's counters into the result before it goes away.
    fn absorb(&mut self, node: &SimNode) {
        let buffer = node.buffer.stats();
        let writer = node.writer.stats();
        let coordinator = node.coordinator.stats();
        self.result.dropped += buffer.dropped + writer.records_dropped;
        self.result.commits += coordinator.commits;
        self.result.aborts += coordinator.aborts;
        self.result.conflicts += coordinator.conflicts;
    }

    async fn settled(&self) -> Result<bool, SimulationError> {
        let backlog = self
            .nodes
            .iter()
            .any(|n| n.writer.backlog_len() > 0 || !n.buffer.is_empty());
        let pending = list_pending(self.store.as_ref(), &self.location).await?;
        Ok(!backlog && pending.is_empty())
    }
}

/// Logical time at the start of `round`, if representable.
fn round_time(start: DateTime<Utc>, round_ms: u64, round: u64) -> Option<DateTime<Utc>> {
    let elapsed = i64::try_from(round.checked_mul(round_ms)?).ok()?;
    start.checked_add_signed(chrono::Duration::try_milliseconds(elapsed)?)
}

/// Run a full simulation against `store`, which should start out empty.
pub async fn simulate_cluster(
    config: SimulationConfig,
    store: Arc<dyn ObjectStore>,
) -> Result<SimulationResult, SimulationError> {
    if config.nodes == 0
        || config.commit_every == 0
        || config.round_ms == 0
        || config.lease_ttl_ms == 0
        || config.max_backlog_batches == 0
    {
        return Err(SimulationError::Invalid(
            "nodes, commit-every, round-ms, lease-ttl-ms and max-backlog-batches must be positive"
                .into(),
        ));
    }

    let start = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap_or_else(Utc::now);
    let last_round = config.rounds.saturating_add(MAX_DRAIN_ROUNDS);
    if round_time(start, config.round_ms, last_round).is_none() {
        return Err(SimulationError::Invalid(format!(
            "{last_round} rounds of {} ms overflow the simulated clock",
            config.round_ms
        )));
    }
    let clock = |round: u64| round_time(start, config.round_ms, round).unwrap_or(start);

    let mut cluster = Cluster {
        store: Arc::new(FaultInjector {
            inner: store,
            down: AtomicBool::new(false),
        }),
        location: TableLocation::new(config.namespace.clone(), config.table.clone()),
        nodes: Vec::with_capacity(config.nodes),
        rng: StdRng::seed_from_u64(config.seed),
        result: SimulationResult::default(),
        config: config.clone(),
    };
    for i in 0..config.nodes {
        let node = cluster.boot(NodeId::new(format!("node-{}", i + 1)), start).await?;
        cluster.nodes.push(node);
    }

    for round in 0..config.rounds {
        let now = clock(round);
        if let Some((from, to)) = config.outage {
            cluster.store.set_down(round >= from && round < to);
        }
        for node in 0..cluster.nodes.len() {
            cluster.traffic(node, round, now);
        }
        cluster.step(round, now, round % config.commit_every == 0).await;

        if config.crash_leader_at == Some(round) {
            cluster.crash_leader(now).await?;
        }
    }

    cluster.store.set_down(false);
    let mut drain_rounds = 0;
    while drain_rounds < MAX_DRAIN_ROUNDS {
        let round = config.rounds + drain_rounds;
        cluster.step(round, clock(round), true).await;
        drain_rounds += 1;
        if cluster.settled().await? {
            break;
        }
    }

    let nodes = std::mem::take(&mut cluster.nodes);
    for node in &nodes {
        cluster.absorb(node);
    }

    let mut result = cluster.result;
    result.rounds = config.rounds;
    result.drain_rounds = drain_rounds;
    verify(&mut result, cluster.store.clone(), &cluster.location).await?;

    tracing::info!(
        recorded = result.recorded,
        committed = result.committed_rows,
        duplicates = result.duplicate_records,
        snapshots = result.snapshots,
        "simulation finished"
    );
    Ok(result)
}

/// Read every committed segment back and count rows and duplicate ids.
async fn verify(
    result: &mut SimulationResult,
    store: Arc<dyn ObjectStore>,
    location: &TableLocation,
) -> Result<(), SimulationError> {
    let catalog = ObjectStoreCatalog::open(store.clone(), location.clone()).await?;
    let history = replay_history(&catalog).await?;
    let metadata = catalog.metadata().await?;

    let mut seen = HashSet::new();
    for segment in metadata.segments() {
        for record in decode_segment(store.get(&segment.path).await?)? {
            result.committed_rows += 1;
            if !seen.insert(record.request_id) {
                result.duplicate_records += 1;
            }
        }
        result.committed_segments += 1;
    }
    result.snapshots = metadata.snapshot_log.len() as u64;
    result.leader_tokens = history.terms.keys().copied().collect();
    result.pending_left = list_pending(store.as_ref(), location).await?.len() as u64;
    Ok(())
}
