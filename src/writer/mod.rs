//! Throttled background persistence of the active batch.
//!
//! Workers hand over snapshots with [`BatchWriter::schedule_write`], which never
//! blocks. A single background task coalesces whatever is queued down to the newest
//! snapshot and writes it through the [`BatchStore`], at most once per
//! `min_interval` unless a flush is pending.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::batch::BatchState;
use crate::store::BatchStore;

/// Tuning for the background writer
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Minimum time between two physical writes
    pub min_interval: Duration,
    /// Pending snapshots kept before the oldest is dropped
    pub queue_capacity: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            queue_capacity: 64,
        }
    }
}

struct Shared {
    // (sequence number, snapshot), oldest first
    queue: Mutex<VecDeque<(u64, BatchState)>>,
    scheduled: AtomicU64,
    work: Notify,
    // Highest sequence number a caller of `flush` is waiting for
    flush_target: AtomicU64,
    flush_wake: Notify,
    stopping: AtomicBool,
    writes: AtomicU64,
    // Highest sequence number that is on disk or superseded by something on disk
    settled: watch::Sender<u64>,
}

impl Shared {
    fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// A flush is waiting for something that is not on disk yet
    fn flush_pending(&self) -> bool {
        self.flush_target.load(Ordering::Acquire) > *self.settled.borrow()
    }

    /// Drain the queue, keeping only the newest snapshot
    fn take_latest(&self) -> Option<(u64, BatchState)> {
        let mut queue = self.queue.lock();
        let latest = queue.pop_back();
        let discarded = queue.len();
        queue.clear();
        if discarded > 0 {
            tracing::debug!("Coalesced {} queued batch states", discarded);
        }
        latest
    }
}

/// Background writer that turns bursts of state updates into infrequent writes.
///
/// Constructed once by the application's composition root and shared by `Arc`.
pub struct BatchWriter {
    shared: Arc<Shared>,
    capacity: usize,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl BatchWriter {
    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn start(store: Arc<BatchStore>, options: WriterOptions) -> Arc<Self> {
        let (settled, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            scheduled: AtomicU64::new(0),
            work: Notify::new(),
            flush_target: AtomicU64::new(0),
            flush_wake: Notify::new(),
            stopping: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            settled,
        });

        let handle = tokio::spawn(writer_loop(
            Arc::clone(&shared),
            store,
            options.min_interval,
        ));
        tracing::info!("Batch writer started");

        Arc::new(Self {
            shared,
            capacity: options.queue_capacity.max(1),
            handle: Mutex::new(Some(handle)),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Queue a snapshot for persistence without blocking.
    ///
    /// Only the newest queued snapshot is ever written. When the queue is full the
    /// oldest entry is dropped.
    pub fn schedule_write(&self, state: BatchState) {
        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::warn!("Writer is shutting down, dropping write for {}", state.batch_id);
            return;
        }

        {
            let mut queue = self.shared.queue.lock();
            // Sequence numbers are assigned under the queue lock so queue order matches them
            let seq = self.shared.scheduled.fetch_add(1, Ordering::AcqRel) + 1;
            if queue.len() >= self.capacity {
                tracing::warn!("Write queue full, dropping oldest state");
                queue.pop_front();
            }
            tracing::debug!("Scheduled write #{} for batch {}", seq, state.batch_id);
            queue.push_back((seq, state));
        }
        self.shared.work.notify_one();
    }

    /// Wait until everything scheduled before this call is on disk.
    ///
    /// Bypasses the throttle. Returns `false` on timeout, when the last write
    /// attempt failed, or once the writer is shut down.
    pub async fn flush(&self, timeout: Duration) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::warn!("Writer is shut down, cannot flush");
            return false;
        }

        let target = {
            let _queue = self.shared.queue.lock();
            self.shared.scheduled.load(Ordering::Acquire)
        };

        let mut settled = self.shared.settled.subscribe();
        if *settled.borrow() >= target {
            return true;
        }

        tracing::debug!("Flushing pending writes up to #{}", target);
        self.shared.flush_target.fetch_max(target, Ordering::AcqRel);
        self.shared.flush_wake.notify_one();
        self.shared.work.notify_one();

        let waited = tokio::time::timeout(timeout, settled.wait_for(|seq| *seq >= target)).await;
        match waited {
            Ok(Ok(_)) => {
                tracing::debug!("Flush completed");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!("Flush timed out after {:?}", timeout);
                false
            }
        }
    }

    /// Flush, then stop the background task. Later calls do nothing.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down batch writer...");

        self.flush(timeout / 2).await;

        self.shared.stopping.store(true, Ordering::Release);
        self.shared.work.notify_one();

        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(timeout / 2, &mut handle).await {
            Ok(_) => tracing::info!("Batch writer stopped"),
            Err(_) => {
                tracing::warn!("Batch writer did not stop in time");
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Number of physical writes attempted so far
    pub fn writes_performed(&self) -> u64 {
        self.shared.writes.load(Ordering::Acquire)
    }
}

async fn writer_loop(shared: Arc<Shared>, store: Arc<BatchStore>, min_interval: Duration) {
    tracing::debug!("Writer loop started");
    let mut last_write: Option<Instant> = None;

    loop {
        if shared.is_idle() {
            if shared.stopping.load(Ordering::Acquire) {
                break;
            }
            shared.work.notified().await;
            continue;
        }

        if let Some(deadline) = last_write.map(|t| t + min_interval) {
            if !shared.flush_pending() && Instant::now() < deadline {
                tracing::debug!(
                    "Throttling write for {:?}",
                    deadline.saturating_duration_since(Instant::now())
                );
                // A wake-up left over from an already satisfied flush only re-checks
                while !shared.flush_pending() && Instant::now() < deadline {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = shared.flush_wake.notified() => {}
                    }
                }
            }
        }

        let Some((seq, state)) = shared.take_latest() else {
            continue;
        };

        let batch_id = state.batch_id.clone();
        let store = Arc::clone(&store);
        let result = tokio::task::spawn_blocking(move || {
            let mut state = state;
            store.save_active(&mut state)
        })
        .await;

        last_write = Some(Instant::now());
        shared.writes.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(Ok(())) => {
                tracing::debug!("Wrote batch state #{} for {}", seq, batch_id);
                shared.settled.send_modify(|settled| *settled = (*settled).max(seq));
            }
            Ok(Err(e)) => tracing::error!("Failed to write batch state: {}", e),
            Err(e) => tracing::error!("Batch state write task failed: {}", e),
        }
    }

    tracing::debug!("Writer loop exited");
}
