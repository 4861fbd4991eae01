use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// Force 128-byte alignment to prevent false sharing.
// Modern CPUs prefetch adjacent cache lines, so we use double cache line size.
#[repr(align(128))]
struct CachePadded<T>(T);

/// Queue counters, reported by the recorder at exit.
pub(crate) struct RingBufferStats {
    pub pushes: AtomicU64,
    pub pops: AtomicU64,
    pub push_errors: AtomicU64,
    pub max_depth: AtomicU64,
}

impl RingBufferStats {
    pub const fn new() -> Self {
        Self {
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            push_errors: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
        }
    }
}

impl Default for RingBufferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingBufferSnapshot {
    pub pushes: u64,
    pub pops: u64,
    pub push_errors: u64,
    pub max_depth: u64,
}

struct Slot<T> {
    /// Equals the slot's position when empty and position + 1 once written.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free queue with per-slot sequence numbers.
///
/// Producers never block: a full buffer hands the value back. Pushes from one
/// thread take strictly increasing positions, so a single consumer observes
/// them in the order they were made.
pub struct RingBuffer<T> {
    // Producer-owned: padded to own cache line
    head: CachePadded<AtomicUsize>,
    // Consumer-owned: padded to separate cache line
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[Slot<T>]>,
    stats: CachePadded<RingBufferStats>,
}

// Safety: values are moved in and out under the sequence protocol; a slot is
// only touched by the thread that won its position.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Capacity is rounded up to a power of two (minimum 2).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
            stats: CachePadded(RingBufferStats::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Try to push a value. Returns it back if the buffer is full.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        self.note_push(pos);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                self.stats.0.push_errors.fetch_add(1, Ordering::Relaxed);
                return Err(value);
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    fn note_push(&self, pos: usize) {
        self.stats.0.pushes.fetch_add(1, Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        let depth = pos.wrapping_add(1).wrapping_sub(tail);
        self.stats
            .0
            .max_depth
            .fetch_max(depth as u64, Ordering::Relaxed);
    }

    /// Pop the oldest published value.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;

            if diff == 0 {
                match self.tail.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        self.stats.0.pops.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Values published and not yet popped.
    pub fn depth(&self) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn stats(&self) -> RingBufferSnapshot {
        RingBufferSnapshot {
            pushes: self.stats.0.pushes.load(Ordering::Relaxed),
            pops: self.stats.0.pops.load(Ordering::Relaxed),
            push_errors: self.stats.0.push_errors.load(Ordering::Relaxed),
            max_depth: self.stats.0.max_depth.load(Ordering::Relaxed),
        }
    }

    /// Discard every published value and rewind to an empty buffer.
    ///
    /// # Safety
    /// No other thread may touch the buffer concurrently. Meant for the child
    /// side of `fork`, where the caller is the only thread. A value that a
    /// producer had reserved but not published at fork time is leaked.
    pub unsafe fn reset(&self) {
        while self.pop().is_some() {}
        for (i, slot) in self.slots.iter().enumerate() {
            slot.seq.store(i, Ordering::Relaxed);
        }
        self.head.0.store(0, Ordering::Relaxed);
        self.tail.0.store(0, Ordering::Release);
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
