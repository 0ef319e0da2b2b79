// Leader Election
//
// Lease-based election of the single commit coordinator. Nodes contend for
// one lease record; every successful acquisition mints a strictly larger
// fencing token, and the token is what the catalog checks to turn away a
// leader that has been superseded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::record::NodeId;
use crate::storage::StorageError;

pub mod memory;
pub mod object_store;

pub use memory::InMemoryLock;
pub use object_store::ObjectStoreLock;

/// Proof of lease ownership. Larger is more recent.
pub type FencingToken = u64;

/// Distributed lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LeaseRecord {
    pub holder: NodeId,
    pub token: FencingToken,
    /// Incremented by every renewal within one term.
    pub renewal: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease held by {holder} with token {token}")]
    Held { holder: NodeId, token: FencingToken },

    #[error("lost acquisition race for token {0}")]
    Contended(FencingToken),

    #[error("stale fencing token {ours}, current is {current}")]
    Stale {
        ours: FencingToken,
        current: FencingToken,
    },

    #[error("lease with token {0} expired before renewal")]
    Expired(FencingToken),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Backing store for the lease.
///
/// Implementations must guarantee that `acquire` hands out each token value
/// to at most one caller, and that `renew` refuses any lease whose token is
/// no longer the current one.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// The authoritative lease, if any was ever granted.
    async fn current(&self) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Take the lease if it is free or expired.
    async fn acquire(
        &self,
        node: &NodeId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError>;

    /// Extend a held lease.
    async fn renew(
        &self,
        lease: &LeaseRecord,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError>;

    /// Give the lease up early so another node can take over.
    async fn release(&self, lease: &LeaseRecord, now: DateTime<Utc>) -> Result<(), LeaseError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectorState {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// What the elector publishes to the rest of the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leadership {
    pub state: ElectorState,
    /// Set only while `state` is `Leader`.
    pub token: Option<FencingToken>,
}

impl Leadership {
    pub fn is_leader_with(&self, token: FencingToken) -> bool {
        self.state == ElectorState::Leader && self.token == Some(token)
    }
}

pub struct LeaderElector {
    node: NodeId,
    lock: Arc<dyn LeaseLock>,
    ttl: Duration,
    lease: Option<LeaseRecord>,
    state: ElectorState,
    tx: watch::Sender<Leadership>,
}

impl LeaderElector {
    /// Every elector starts as a follower, including after a restart.
    pub fn new(node: NodeId, lock: Arc<dyn LeaseLock>, ttl: Duration) -> Self {
        let (tx, _) = watch::channel(Leadership::default());
        Self {
            node,
            lock,
            ttl,
            lease: None,
            state: ElectorState::Follower,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ElectorState {
        self.state
    }

    pub fn token(&self) -> Option<FencingToken> {
        self.lease.as_ref().map(|l| l.token)
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Advance the state machine once.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> ElectorState {
        match self.state {
            ElectorState::Leader => self.renew(now).await,
            ElectorState::Follower | ElectorState::Candidate => self.contend(now).await,
        }
        self.state
    }

    async fn renew(&mut self, now: DateTime<Utc>) {
        let Some(lease) = self.lease.take() else {
            self.transition(ElectorState::Follower);
            return;
        };

        // bounded by what is left of the term
        let remaining = (lease.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        match timeout(remaining, self.lock.renew(&lease, now, self.ttl)).await {
            Ok(Ok(renewed)) => {
                tracing::trace!(node = %self.node, token = renewed.token, "lease renewed");
                self.lease = Some(renewed);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    node = %self.node,
                    token = lease.token,
                    error = %e,
                    "lease renewal failed, stepping down"
                );
                self.transition(ElectorState::Follower);
            }
            Err(_) => {
                tracing::warn!(
                    node = %self.node,
                    token = lease.token,
                    "lease renewal timed out, stepping down"
                );
                self.transition(ElectorState::Follower);
            }
        }
    }

    async fn contend(&mut self, now: DateTime<Utc>) {
        match timeout(self.ttl, self.lock.current()).await {
            Ok(Ok(Some(current))) if !current.is_expired(now) => {
                self.transition(ElectorState::Follower);
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(node = %self.node, error = %e, "could not read lease");
                self.transition(ElectorState::Follower);
                return;
            }
            Err(_) => {
                tracing::warn!(node = %self.node, "lease read timed out");
                self.transition(ElectorState::Follower);
                return;
            }
        }

        self.transition(ElectorState::Candidate);
        match timeout(self.ttl, self.lock.acquire(&self.node, now, self.ttl)).await {
            Ok(Ok(lease)) => {
                tracing::info!(node = %self.node, token = lease.token, "acquired leadership");
                self.lease = Some(lease);
                self.transition(ElectorState::Leader);
            }
            Ok(Err(e)) => {
                tracing::debug!(node = %self.node, error = %e, "lease acquisition failed");
                self.transition(ElectorState::Follower);
            }
            Err(_) => {
                tracing::warn!(node = %self.node, "lease acquisition timed out");
                self.transition(ElectorState::Follower);
            }
        }
    }

    /// Release the lease, if held, and become a follower.
    pub async fn step_down(&mut self, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.lock.release(&lease, now).await {
                tracing::warn!(node = %self.node, token = lease.token, error = %e, "lease release failed");
            } else {
                tracing::info!(node = %self.node, token = lease.token, "released leadership");
            }
        }
        self.transition(ElectorState::Follower);
    }

    fn transition(&mut self, next: ElectorState) {
        if next != ElectorState::Leader {
            self.lease = None;
        }
        self.state = next;
        let published = Leadership {
            state: next,
            token: self.token().filter(|_| next == ElectorState::Leader),
        };
        self.tx.send_if_modified(|current| {
            let changed = *current != published;
            *current = published;
            changed
        });
    }
}
