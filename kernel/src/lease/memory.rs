// In-process lease lock, shared by the electors of a single-process cluster.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{expiry, LeaseError, LeaseLock, LeaseRecord};
use crate::record::NodeId;

#[derive(Debug, Default)]
pub struct InMemoryLock {
    lease: Mutex<Option<LeaseRecord>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for InMemoryLock {
    async fn current(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.lease.lock().clone())
    }

    async fn acquire(
        &self,
        node: &NodeId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError> {
        let mut slot = self.lease.lock();
        if let Some(current) = slot.as_ref() {
            if !current.is_expired(now) {
                return Err(LeaseError::Held {
                    holder: current.holder.clone(),
                    token: current.token,
                });
            }
        }

        let lease = LeaseRecord {
            holder: node.clone(),
            token: slot.as_ref().map_or(0, |l| l.token) + 1,
            renewal: 0,
            acquired_at: now,
            expires_at: expiry(now, ttl),
        };
        *slot = Some(lease.clone());
        Ok(lease)
    }

    async fn renew(
        &self,
        lease: &LeaseRecord,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseRecord, LeaseError> {
        let mut slot = self.lease.lock();
        let Some(current) = slot.as_mut() else {
            return Err(LeaseError::Expired(lease.token));
        };
        if current.token != lease.token || current.holder != lease.holder {
            return Err(LeaseError::Stale {
                ours: lease.token,
                current: current.token,
            });
        }
        if current.is_expired(now) {
            return Err(LeaseError::Expired(lease.token));
        }

        current.renewal += 1;
        current.expires_at = expiry(now, ttl);
        Ok(current.clone())
    }

    async fn release(&self, lease: &LeaseRecord, now: DateTime<Utc>) -> Result<(), LeaseError> {
        let mut slot = self.lease.lock();
        if let Some(current) = slot.as_mut() {
            if current.token == lease.token && current.expires_at > now {
                current.expires_at = now;
            }
        }
        Ok(())
    }
}
