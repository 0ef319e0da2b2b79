// Event Buffer
//
// Per-node accumulator of log records awaiting flush. The record path is
// called from request handling and never waits on I/O; capacity exhaustion
// degrades by dropping events instead of blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::record::LogRecord;

/// What to discard when the buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event to make room.
    #[default]
    DropOldest,

    /// Reject the incoming event.
    DropNewest,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub recorded: u64,
    pub dropped: u64,
    pub drained: u64,
}

#[derive(Debug)]
pub struct EventBuffer {
    events: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    batch_size: usize,
    policy: OverflowPolicy,
    flush: Notify,
    overflowing: AtomicBool,
    recorded: AtomicU64,
    dropped: AtomicU64,
    drained: AtomicU64,
}

impl EventBuffer {
    /// `batch_size` is the length at which a flush is requested early.
    pub fn new(capacity: usize, batch_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
            policy,
            flush: Notify::new(),
            overflowing: AtomicBool::new(false),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    /// Append an event.
    pub fn record(&self, event: LogRecord) {
        let len = {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        capacity = self.capacity,
                        policy = ?self.policy,
                        "event buffer full, dropping events"
                    );
                }
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        events.pop_front();
                    }
                    OverflowPolicy::DropNewest => return,
                }
            }
            events.push_back(event);
            events.len()
        };

        self.recorded.fetch_add(1, Ordering::Relaxed);
        if len >= self.batch_size {
            self.flush.notify_one();
        }
    }

    /// Remove and return everything buffered so far, in insertion order.
    pub fn drain(&self) -> Vec<LogRecord> {
        let drained = std::mem::take(&mut *self.events.lock());
        self.overflowing.store(false, Ordering::Relaxed);
        self.drained
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.into()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolves once the buffer has reached the batch-size threshold.
    ///
    /// A notification issued while nobody waits is kept, so a threshold
    /// crossed between two waits is not missed.
    pub async fn flush_requested(&self) {
        self.flush.notified().await
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
