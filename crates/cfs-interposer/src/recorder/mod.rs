//! Access Recorder
//!
//! Shims hand finished [`AccessEvent`]s to [`Recorder::submit`], which only
//! pushes into a bounded ring buffer and never waits. Delivery to the
//! collector happens on the consumer side:
//!
//! - the background worker (started lazily from the first tracked call)
//! - [`Recorder::flush`], run before exec and by the exit finalizer
//!
//! Every consumer drains under the sink lock, so there is exactly one at a
//! time and events leave in queue order. Failures are counted and never
//! reported to the traced program.

pub mod socket;
mod worker;

pub use socket::SocketSink;

use crate::sync::{RingBuffer, RingBufferSnapshot};
use cfs_config::{log_recorder_debug, log_recorder_warn};
use cfs_ipc::{AccessEvent, CollectorMessage, IpcError, SessionStats};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Events moved per lock acquisition.
const DRAIN_BATCH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("no collector configured")]
    NotConfigured,
    #[error("cannot connect to collector at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("send to collector failed: {0}")]
    Send(#[source] io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] IpcError),
    #[error("circuit breaker open")]
    CircuitOpen,
}

/// Delivery backend.
pub trait EventSink: Send {
    fn send(&mut self, message: &CollectorMessage) -> Result<(), RecordError>;

    /// Forget any per-process connection state. Called in a fork child.
    fn reset(&mut self) {}
}

/// Sink used when no collector is configured: every event is undeliverable.
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&mut self, _message: &CollectorMessage) -> Result<(), RecordError> {
        Err(RecordError::NotConfigured)
    }
}

pub type SinkGuard<'a> = MutexGuard<'a, Box<dyn EventSink>>;

pub struct Recorder {
    queue: RingBuffer<AccessEvent>,
    sink: Mutex<Box<dyn EventSink>>,
    worker_started: AtomicBool,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_undeliverable: AtomicU64,
}

impl Recorder {
    pub fn new(capacity: usize, sink: Box<dyn EventSink>) -> Self {
        Self {
            queue: RingBuffer::with_capacity(capacity),
            sink: Mutex::new(sink),
            worker_started: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_undeliverable: AtomicU64::new(0),
        }
    }

    /// Queue an event. Drops it when the buffer is full.
    pub fn submit(&self, event: AccessEvent) {
        match self.queue.push(event) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.depth()
    }

    pub fn queue_stats(&self) -> RingBufferSnapshot {
        self.queue.stats()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_undeliverable: self.dropped_undeliverable.load(Ordering::Relaxed),
        }
    }

    /// Start the background worker once per process.
    pub fn ensure_worker(&'static self) {
        if self.worker_started.load(Ordering::Relaxed) {
            return;
        }
        if !self.worker_started.swap(true, Ordering::AcqRel) && !worker::spawn(self) {
            // Leave the flag set: flush at exec and exit still delivers.
            log_recorder_warn!("Worker thread could not be started");
        }
    }

    fn lock_sink(&self) -> SinkGuard<'_> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_sink(&self) -> Option<SinkGuard<'_>> {
        match self.sink.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Deliver up to one batch. Returns the number of events taken off the queue.
    pub fn drain_batch(&self) -> usize {
        if self.queue.is_empty() {
            return 0;
        }
        let mut sink = self.lock_sink();
        self.drain_locked(&mut sink, DRAIN_BATCH, None)
    }

    fn drain_locked(&self, sink: &mut SinkGuard<'_>, max: usize, deadline: Option<Instant>) -> usize {
        let mut taken = 0;
        while taken < max {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let Some(event) = self.queue.pop() else { break };
            taken += 1;
            self.deliver(sink, CollectorMessage::Event(event));
        }
        taken
    }

    fn deliver(&self, sink: &mut SinkGuard<'_>, message: CollectorMessage) {
        match sink.send(&message) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped_undeliverable.fetch_add(1, Ordering::Relaxed);
                // The breaker already logged when it opened
                if !matches!(e, RecordError::CircuitOpen) {
                    log_recorder_debug!("Event dropped", error = tracing::field::display(&e));
                }
            }
        }
    }

    /// Drain the queue synchronously, giving up at `timeout`.
    ///
    /// Returns true if the queue was emptied. Events still queued at the
    /// deadline are discarded and counted as undeliverable.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Some(mut sink) = self.lock_until(deadline) else {
            return self.discard_remaining();
        };
        while !self.queue.is_empty() && Instant::now() < deadline {
            self.drain_locked(&mut sink, usize::MAX, Some(deadline));
        }
        drop(sink);
        self.discard_remaining()
    }

    /// Flush, then tell the collector this process is done.
    pub fn finish(&self, pid: u32, timeout: Duration) -> SessionStats {
        let deadline = Instant::now() + timeout;
        self.flush(timeout);
        let stats = self.stats();
        if let Some(mut sink) = self.lock_until(deadline) {
            // Goodbye is not an event and does not move the counters
            if let Err(e) = sink.send(&CollectorMessage::Goodbye { pid, stats }) {
                log_recorder_debug!("Goodbye not delivered", error = tracing::field::display(&e));
            }
        }
        stats
    }

    fn lock_until(&self, deadline: Instant) -> Option<SinkGuard<'_>> {
        loop {
            if let Some(guard) = self.try_lock_sink() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn discard_remaining(&self) -> bool {
        let mut lost = 0u64;
        while self.queue.pop().is_some() {
            lost += 1;
        }
        if lost > 0 {
            self.dropped_undeliverable.fetch_add(lost, Ordering::Relaxed);
            log_recorder_warn!("Flush deadline reached, events discarded", count = lost);
        }
        lost == 0
    }

    /// Take the sink lock ahead of `fork`.
    pub fn lock_for_fork(&self) -> SinkGuard<'_> {
        self.lock_sink()
    }

    /// Child side of `fork`: the worker thread and the connection belong to
    /// the parent.
    ///
    /// # Safety
    /// Must run in the fork child while it is still single-threaded, with
    /// `sink` obtained from [`Recorder::lock_for_fork`] before the fork.
    pub unsafe fn reset_after_fork(&self, mut sink: SinkGuard<'_>) {
        self.queue.reset();
        sink.reset();
        drop(sink);
        self.worker_started.store(false, Ordering::Relaxed);
    }
}
