//! Offline-first queue of submissions awaiting confirmed delivery.
//!
//! Records go in at the back and only leave after the sink acknowledges them. A flush walks the
//! queue front to back, one delivery at a time, and keeps going past failures; whatever failed
//! stays where it was for the next trigger. Triggers are events only (connectivity restored, a
//! manual submit, startup): there are no timers and no backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::queue_store::QueueStore;
use crate::record::Record;

/// Where records are delivered to.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Delivers one record. `Ok` means the remote acknowledged it.
    async fn deliver(&self, record: &Record) -> Result<()>;
}

/// Whether the last write reached durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Persistence {
    #[default]
    Persisted,
    /// The in-memory queue is intact but will not survive a restart.
    Degraded { reason: String },
}

impl Persistence {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Persistence::Persisted)
    }
}

/// Result of [`SubmissionQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    /// Queue length after the append.
    pub pending: usize,
    pub persistence: Persistence,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Records the pass tried to deliver.
    pub attempted: usize,
    /// Records acknowledged and removed.
    pub delivered: usize,
    /// Queue length once the pass finished.
    pub remaining: usize,
    /// Another flush was already running, so this one did nothing.
    pub skipped: bool,
    /// Outcome of saving the shortened queue. When degraded, delivered records may still be in
    /// storage and would be sent again after a restart.
    pub persistence: Persistence,
}

impl FlushReport {
    fn skipped(remaining: usize) -> Self {
        Self {
            remaining,
            skipped: true,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The pending-submission queue.
///
/// Built once by the composition root with its storage and sink injected. All methods take
/// `&self`; mutations are serialized by an internal lock that is never held across an await.
pub struct SubmissionQueue {
    store: Arc<dyn QueueStore>,
    sink: Arc<dyn DeliverySink>,
    pending: Mutex<Vec<Record>>,
    online: AtomicBool,
    flushing: AtomicBool,
    durable: AtomicBool,
    delivery_timeout: Duration,
}

impl SubmissionQueue {
    /// Rehydrates the queue from `store`.
    ///
    /// Unreadable persisted data is logged and dropped; the queue then starts empty.
    pub fn open(
        store: Arc<dyn QueueStore>,
        sink: Arc<dyn DeliverySink>,
        delivery_timeout: Duration,
        online: bool,
    ) -> Self {
        let pending = match store.load() {
            Ok(records) => {
                info!("Loaded {} pending submission(s)", records.len());
                records
            }
            Err(e) => {
                error!("Error reading pending submissions, starting empty: {e}");
                Vec::new()
            }
        };

        Self {
            store,
            sink,
            pending: Mutex::new(pending),
            online: AtomicBool::new(online),
            flushing: AtomicBool::new(false),
            durable: AtomicBool::new(true),
            delivery_timeout,
        }
    }

    /// Appends `record` and persists the whole queue.
    pub fn enqueue(&self, record: Record) -> EnqueueReport {
        let mut pending = self.lock_pending();
        pending.push(record);
        let persistence = self.persist(&pending);

        debug!("Submission queued. Pending: {}", pending.len());
        EnqueueReport {
            pending: pending.len(),
            persistence,
        }
    }

    /// Attempts delivery of everything currently queued, in queue order.
    ///
    /// Records enqueued while the pass is running are left for the next one. If a flush is
    /// already in progress this returns immediately with `skipped` set.
    pub async fn flush(&self) -> FlushReport {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!("Flush already in progress, skipping");
            return FlushReport::skipped(self.pending_count());
        };

        let batch = self.snapshot();
        if batch.is_empty() {
            return FlushReport::default();
        }

        info!("Syncing {} pending submission(s)...", batch.len());

        let mut delivered = Vec::with_capacity(batch.len());
        for (index, record) in batch.iter().enumerate() {
            match self.deliver(record).await {
                Ok(()) => delivered.push(index),
                Err(e) => warn!(
                    "Sync error for item {index} ({}, {}): {e}",
                    record.health_facility(),
                    record.timestamp()
                ),
            }
        }

        let (remaining, persistence) = if delivered.is_empty() {
            (self.pending_count(), Persistence::Persisted)
        } else {
            // Only a flush removes records and only one runs at a time, so the batch is still
            // the head of the queue.
            let mut pending = self.lock_pending();
            let mut position = 0;
            pending.retain(|_| {
                let keep = delivered.binary_search(&position).is_err();
                position += 1;
                keep
            });
            let persistence = self.persist(&pending);
            (pending.len(), persistence)
        };

        if delivered.is_empty() {
            warn!("Sync delivered nothing; {} submission(s) still pending", remaining);
        } else {
            info!(
                "Successfully synced {} submission(s), {} still pending",
                delivered.len(),
                remaining
            );
        }

        FlushReport {
            attempted: batch.len(),
            delivered: delivered.len(),
            remaining,
            skipped: false,
            persistence,
        }
    }

    /// Delivers one record outside the queue, bounded by the delivery timeout.
    pub async fn deliver(&self, record: &Record) -> Result<()> {
        match tokio::time::timeout(self.delivery_timeout, self.sink.deliver(record)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(self.delivery_timeout.as_secs())),
        }
    }

    /// Handles a "became online" signal.
    ///
    /// Flushes only on an actual offline to online transition; a repeated online signal returns
    /// `None`.
    pub async fn on_connectivity_restored(&self) -> Option<FlushReport> {
        if self.online.swap(true, Ordering::AcqRel) {
            debug!("Already online, ignoring connectivity signal");
            return None;
        }

        info!("Back online - syncing pending submissions");
        Some(self.flush().await)
    }

    /// Handles a "became offline" signal. Queued records stay queued.
    pub fn on_connectivity_lost(&self) {
        if self.online.swap(false, Ordering::AcqRel) {
            info!("Offline - submissions will be saved locally");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// False once a write to storage has failed, until a later write succeeds.
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Copy of the queued records, front first.
    pub fn snapshot(&self) -> Vec<Record> {
        self.lock_pending().clone()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<Record>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &[Record]) -> Persistence {
        match self.store.save(records) {
            Ok(()) => {
                self.durable.store(true, Ordering::Release);
                Persistence::Persisted
            }
            Err(e) => {
                warn!("Could not persist pending submissions, continuing in memory: {e}");
                self.durable.store(false, Ordering::Release);
                Persistence::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}
