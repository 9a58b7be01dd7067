//! Bounded frame buffer exchange between one decoder thread and one consumer
//!
//! **Why**: Each ClipWorkflow owns a small fixed pool of frame buffers. The
//! decoder takes a free one, fills it and commits it; the scheduler pops
//! (or peeks) committed frames and hands them back when done. Memory is
//! bounded by the pool size and a full pool throttles the decoder.
//!
//! **Used by**: ClipWorkflow (owner), FrameSink (producer side), TrackWorkflow (consumer)
//!
//! # Accounting
//!
//! Every buffer is always in exactly one place:
//!
//! ```text
//! available ──take──> in_flight ──commit──> computed ──pop──> borrowed
//!     ^                   │ cancel / stale                       │
//!     └───────────────────┴──────────────────────────────────────┘ release
//! ```
//!
//! so `available + in_flight + computed + borrowed == capacity` holds for the
//! whole life of the pool.
//!
//! # Generations
//!
//! A seek flushes computed frames and bumps `generation`. A frame locked
//! before the flush commits with its old generation and is recycled without
//! ever reaching the consumer. The seek target is stored in the pool under the
//! same lock, so the next slot handed to the decoder carries it.

use log::trace;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::entities::frame::{FrameBuffer, OutputFormat};

/// Placeholder swapped into a StackedBuffer while it is being released
static DETACHED: Lazy<Arc<FrameBuffer>> = Lazy::new(|| {
    Arc::new(FrameBuffer::new(OutputFormat::Video {
        width: 0,
        height: 0,
        pixel_size: 0,
        fps: 0.0,
    }))
});

/// How the consumer reads the head of the computed queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Remove and take exclusive ownership (recycled on release)
    Pop,
    /// Peek without removing (repeated reads while paused)
    Get,
}

/// Terminal conditions that stop the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Stopped,
    EndReached,
    Error,
}

/// Producer gate decision, evaluated under the pool lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Hold,
    Close,
}

/// Snapshot of buffer accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub available: usize,
    pub computed: usize,
    pub borrowed: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub generation: u64,
}

impl PoolStats {
    /// Buffers accounted for; equals `capacity` unless a buffer leaked
    pub fn total(&self) -> usize {
        self.available + self.computed + self.borrowed + self.in_flight
    }
}

/// Free buffer handed to the producer
pub(crate) struct Lease {
    pub buffer: FrameBuffer,
    pub generation: u64,
    pub seek: Option<i64>,
}

/// Result of waiting for a computed frame
pub enum PoolOutput {
    Frame(StackedBuffer),
    Halted(Halt),
    Timeout,
}

struct PoolInner {
    available: Vec<Arc<FrameBuffer>>,
    computed: VecDeque<Arc<FrameBuffer>>,
    borrowed: usize,
    in_flight: usize,
    halt: Option<Halt>,
    generation: u64,
    previous_pts: Option<i64>,
    pending_seek: Option<i64>,
}

pub struct BufferPool {
    format: OutputFormat,
    capacity: usize,
    inner: Mutex<PoolInner>,
    changed: Condvar,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("format", &self.format)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// Allocate `capacity` zeroed buffers (at least one)
    pub fn new(format: OutputFormat, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let available = (0..capacity).map(|_| Arc::new(FrameBuffer::new(format))).collect();
        Self {
            format,
            capacity,
            inner: Mutex::new(PoolInner {
                available,
                computed: VecDeque::with_capacity(capacity),
                borrowed: 0,
                in_flight: 0,
                halt: None,
                generation: 0,
                previous_pts: None,
                pending_seek: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ========== Producer side ==========

    /// Block until a free buffer exists and `gate` lets the producer through.
    ///
    /// `gate` receives the number of computed frames and runs with the pool
    /// locked. Returns the halt reason when the exchange is closed.
    pub(crate) fn take_available<F>(&self, mut gate: F) -> Result<Lease, Halt>
    where
        F: FnMut(usize) -> Gate,
    {
        let mut inner = self.lock();
        loop {
            if let Some(halt) = inner.halt {
                return Err(halt);
            }
            match gate(inner.computed.len()) {
                Gate::Close => return Err(Halt::Stopped),
                Gate::Hold => {
                    inner = self.changed.wait(inner).unwrap_or_else(|e| e.into_inner());
                    continue;
                }
                Gate::Proceed => {}
            }
            if let Some(arc) = inner.available.pop() {
                inner.in_flight += 1;
                let generation = inner.generation;
                let seek = inner.pending_seek.take();
                drop(inner);
                // A consumer snapshot may still share this buffer: copy instead of overwrite
                let buffer = Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone());
                return Ok(Lease {
                    buffer,
                    generation,
                    seek,
                });
            }
            inner = self.changed.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Publish a filled buffer. Returns false if it was stale and recycled.
    pub(crate) fn commit(&self, mut buffer: FrameBuffer, generation: u64, pts: i64) -> bool {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        let accepted = inner.halt.is_none() && inner.generation == generation;
        if accepted {
            let diff = inner.previous_pts.map(|prev| pts - prev).unwrap_or(0);
            buffer.set_timing(pts, diff);
            inner.previous_pts = Some(pts);
            inner.computed.push_back(Arc::new(buffer));
        } else {
            trace!(
                "Discarding stale frame pts={} (gen {} != {})",
                pts, generation, inner.generation
            );
            inner.available.push(Arc::new(buffer));
        }
        self.changed.notify_all();
        accepted
    }

    /// Return an unfilled buffer, restoring its seek target if still current
    pub(crate) fn cancel(&self, buffer: FrameBuffer, generation: u64, seek: Option<i64>) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.available.push(Arc::new(buffer));
        if generation == inner.generation && inner.pending_seek.is_none() {
            inner.pending_seek = seek;
        }
        self.changed.notify_all();
    }

    // ========== Consumer side ==========

    /// Wait for the head of the computed queue.
    ///
    /// `Stopped` and `Error` return at once; `EndReached` only once every
    /// computed frame has been served.
    pub fn wait_output(self: &Arc<Self>, mode: GetMode, timeout: Duration) -> PoolOutput {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(halt @ (Halt::Stopped | Halt::Error)) = inner.halt {
                return PoolOutput::Halted(halt);
            }
            match mode {
                GetMode::Pop => {
                    if let Some(buffer) = inner.computed.pop_front() {
                        inner.borrowed += 1;
                        self.changed.notify_all();
                        return PoolOutput::Frame(StackedBuffer {
                            buffer,
                            pool: Some(Arc::clone(self)),
                        });
                    }
                }
                GetMode::Get => {
                    if let Some(front) = inner.computed.front() {
                        return PoolOutput::Frame(StackedBuffer::detached(Arc::clone(front)));
                    }
                }
            }
            if inner.halt == Some(Halt::EndReached) {
                return PoolOutput::Halted(Halt::EndReached);
            }
            let now = Instant::now();
            if now >= deadline {
                return PoolOutput::Timeout;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn release(&self, buffer: Arc<FrameBuffer>) {
        let mut inner = self.lock();
        inner.borrowed = inner.borrowed.saturating_sub(1);
        inner.available.push(buffer);
        self.changed.notify_all();
    }

    // ========== Control ==========

    /// Drop all computed frames and start a new generation
    pub fn flush(&self) {
        let mut inner = self.lock();
        Self::flush_locked(&mut inner);
        self.changed.notify_all();
    }

    /// Flush and record the position the next decoded frame must come from
    pub fn seek(&self, position_ms: i64) {
        let mut inner = self.lock();
        Self::flush_locked(&mut inner);
        inner.pending_seek = Some(position_ms);
        self.changed.notify_all();
    }

    fn flush_locked(inner: &mut PoolInner) {
        while let Some(buffer) = inner.computed.pop_front() {
            inner.available.push(buffer);
        }
        inner.generation += 1;
        inner.previous_pts = None;
        inner.pending_seek = None;
    }

    /// Close the exchange and wake every waiter. An `Error` halt is never
    /// downgraded to `EndReached`.
    pub fn halt(&self, reason: Halt) {
        let mut inner = self.lock();
        if !(reason == Halt::EndReached && inner.halt == Some(Halt::Error)) {
            inner.halt = Some(reason);
        }
        self.changed.notify_all();
    }

    /// Reopen for a new decode session
    pub fn reopen(&self) {
        let mut inner = self.lock();
        Self::flush_locked(&mut inner);
        inner.halt = None;
        self.changed.notify_all();
    }

    /// Wake a producer blocked in its gate after an external state change
    pub fn notify(&self) {
        let _inner = self.lock();
        self.changed.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            available: inner.available.len(),
            computed: inner.computed.len(),
            borrowed: inner.borrowed,
            in_flight: inner.in_flight,
            capacity: self.capacity,
            generation: inner.generation,
        }
    }
}

/// Exclusive handle on a popped frame, returned to its pool on drop.
///
/// Peeked frames (`GetMode::Get`) are detached: they share the buffer with
/// the queue and release nothing.
pub struct StackedBuffer {
    buffer: Arc<FrameBuffer>,
    pool: Option<Arc<BufferPool>>,
}

impl StackedBuffer {
    fn detached(buffer: Arc<FrameBuffer>) -> Self {
        Self { buffer, pool: None }
    }

    /// Read-only view that may outlive the handle
    pub fn snapshot(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    /// True if dropping this handle recycles a pool buffer
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Explicit release; same as dropping
    pub fn release(self) {}
}

impl Deref for StackedBuffer {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl Drop for StackedBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buffer = std::mem::replace(&mut self.buffer, Arc::clone(&DETACHED));
            pool.release(buffer);
        }
    }
}

impl std::fmt::Debug for StackedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackedBuffer")
            .field("pts", &self.buffer.pts())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tiny() -> OutputFormat {
        OutputFormat::Video {
            width: 2,
            height: 2,
            pixel_size: 3,
            fps: 25.0,
        }
    }

    fn produce(pool: &BufferPool, pts: i64) -> bool {
        let lease = pool.take_available(|_| Gate::Proceed).unwrap();
        pool.commit(lease.buffer, lease.generation, pts)
    }

    /// Test: Buffer accounting
    /// Validates: available + computed + borrowed + in_flight stays constant
    #[test]
    fn test_accounting_invariant() {
        let pool = Arc::new(BufferPool::new(tiny(), 3));
        assert_eq!(pool.stats().total(), 3);

        assert!(produce(&pool, 0));
        assert!(produce(&pool, 40));
        let lease = pool.take_available(|_| Gate::Proceed).unwrap();
        let stats = pool.stats();
        assert_eq!((stats.available, stats.computed, stats.in_flight), (0, 2, 1));
        assert_eq!(stats.total(), 3);

        let PoolOutput::Frame(frame) = pool.wait_output(GetMode::Pop, Duration::from_millis(10)) else {
            panic!("expected frame");
        };
        assert_eq!(frame.pts(), 0);
        assert_eq!(pool.stats().borrowed, 1);
        assert_eq!(pool.stats().total(), 3);

        drop(frame);
        pool.cancel(lease.buffer, lease.generation, lease.seek);
        let stats = pool.stats();
        assert_eq!((stats.available, stats.computed, stats.borrowed), (2, 1, 0));
        assert_eq!(stats.total(), 3);
    }

    /// Test: Peek does not consume
    /// Validates: Get returns the same head twice, Pop then advances
    #[test]
    fn test_get_peeks() {
        let pool = Arc::new(BufferPool::new(tiny(), 2));
        produce(&pool, 0);
        produce(&pool, 40);

        for _ in 0..2 {
            let PoolOutput::Frame(f) = pool.wait_output(GetMode::Get, Duration::ZERO) else {
                panic!("expected frame");
            };
            assert_eq!(f.pts(), 0);
            assert!(!f.is_pooled());
        }
        assert_eq!(pool.stats().computed, 2);

        let PoolOutput::Frame(f) = pool.wait_output(GetMode::Pop, Duration::ZERO) else {
            panic!("expected frame");
        };
        assert_eq!(f.pts(), 0);
        drop(f);
        let PoolOutput::Frame(f) = pool.wait_output(GetMode::Pop, Duration::ZERO) else {
            panic!("expected frame");
        };
        assert_eq!(f.pts(), 40);
        assert_eq!(f.pts_diff(), 40);
    }

    /// Test: Seek discards stale work
    /// Validates: frames locked before a seek never reach the consumer
    #[test]
    fn test_seek_discards_stale_commit() {
        let pool = Arc::new(BufferPool::new(tiny(), 2));
        produce(&pool, 0);
        let lease = pool.take_available(|_| Gate::Proceed).unwrap();

        pool.seek(400);
        assert_eq!(pool.stats().computed, 0);
        assert!(!pool.commit(lease.buffer, lease.generation, 40));

        let lease = pool.take_available(|_| Gate::Proceed).unwrap();
        assert_eq!(lease.seek, Some(400));
        assert!(pool.commit(lease.buffer, lease.generation, 400));

        let PoolOutput::Frame(f) = pool.wait_output(GetMode::Pop, Duration::ZERO) else {
            panic!("expected frame");
        };
        assert_eq!(f.pts(), 400);
        assert_eq!(f.pts_diff(), 0);
    }

    /// Test: Cancelled slot keeps the seek target
    #[test]
    fn test_cancel_restores_seek() {
        let pool = BufferPool::new(tiny(), 2);
        pool.seek(80);
        let lease = pool.take_available(|_| Gate::Proceed).unwrap();
        assert_eq!(lease.seek, Some(80));
        pool.cancel(lease.buffer, lease.generation, lease.seek);
        let lease = pool.take_available(|_| Gate::Proceed).unwrap();
        assert_eq!(lease.seek, Some(80));
    }

    /// Test: Halt unblocks waiters
    /// Validates: a consumer blocked on an empty pool returns when stopped
    #[test]
    fn test_halt_wakes_consumer() {
        let pool = Arc::new(BufferPool::new(tiny(), 2));
        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            matches!(
                p.wait_output(GetMode::Pop, Duration::from_secs(10)),
                PoolOutput::Halted(Halt::Stopped)
            )
        });
        thread::sleep(Duration::from_millis(20));
        pool.halt(Halt::Stopped);
        assert!(waiter.join().unwrap());
    }

    /// Test: End of stream drains first
    /// Validates: computed frames are served before EndReached is reported
    #[test]
    fn test_end_reached_drains() {
        let pool = Arc::new(BufferPool::new(tiny(), 2));
        produce(&pool, 0);
        pool.halt(Halt::EndReached);

        assert!(matches!(
            pool.wait_output(GetMode::Pop, Duration::ZERO),
            PoolOutput::Frame(_)
        ));
        assert!(matches!(
            pool.wait_output(GetMode::Pop, Duration::ZERO),
            PoolOutput::Halted(Halt::EndReached)
        ));
    }

    /// Test: Backpressure
    /// Validates: the producer blocks on a full pool until the consumer releases
    #[test]
    fn test_producer_blocks_when_full() {
        let pool = Arc::new(BufferPool::new(tiny(), 1));
        produce(&pool, 0);

        let p = Arc::clone(&pool);
        let producer = thread::spawn(move || produce(&p, 40));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.stats().computed, 1);

        let PoolOutput::Frame(f) = pool.wait_output(GetMode::Pop, Duration::ZERO) else {
            panic!("expected frame");
        };
        f.release();
        assert!(producer.join().unwrap());
        assert!(matches!(
            pool.wait_output(GetMode::Pop, Duration::from_secs(1)),
            PoolOutput::Frame(_)
        ));
    }

    #[test]
    fn test_timeout() {
        let pool = Arc::new(BufferPool::new(tiny(), 1));
        assert!(matches!(
            pool.wait_output(GetMode::Pop, Duration::from_millis(5)),
            PoolOutput::Timeout
        ));
    }
}
