//! The queue engine: a growable FIFO of fixed-size records overlaid on a
//! shared segment.
//!
//! The segment holds a 320-byte header (see [`layout`](crate::layout))
//! followed by a power-of-two ring of records. Three spin-locks inside the
//! header coordinate all participants under a fixed hierarchy:
//!
//! - **head lock** (lowest), taken by producers;
//! - **tail lock**, taken by consumers;
//! - **global lock** (highest), taken to change capacity or mapping
//!   topology.
//!
//! A path may escalate from a lower lock to a higher one, never the
//! reverse. [`push`](ShmQueue::push) takes head first, takes tail next if
//! the ring appears full, and takes global if it must resize.
//! [`pop`](ShmQueue::pop) takes tail, and takes global only to adopt a
//! resize another process performed.
//!
//! The queue is empty iff `head == tail` and full iff
//! `(head + 1) % capacity == tail`: one slot stays permanently reserved,
//! otherwise a full ring and an empty ring would alias. That reserved
//! slot is also what lets the grow path trigger before head catches tail.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::error::{QueueFull, ShmError};
use crate::layout::{self, QueueHeader};
use crate::segment::Segment;
use crate::spinlock::Spinlock;

/// Ring capacity (in records) a fresh segment is initialized to.
pub const INITIAL_CAPACITY: u64 = 64;

/// A per-process handle to the queue inside a [`Segment`].
///
/// Handles cache raw pointers into the mapping (header, ring base) plus
/// the capacity they were derived at; every public operation re-derives
/// the cache when the authoritative capacity has moved on. Records are
/// copied in and out by value, so `T` must be a plain fixed-width type
/// with no owning references into this process.
pub struct ShmQueue<'s, T> {
    seg: &'s mut Segment,
    global_lock: Spinlock,
    head_lock: Spinlock,
    tail_lock: Spinlock,
    hdr: NonNull<QueueHeader>,
    ring: NonNull<T>,
    last_capacity: u64,
}

// Safety: the handle owns its view of the mapping; cross-handle
// coordination happens through the in-segment locks and atomics.
unsafe impl<T: Copy + Send> Send for ShmQueue<'_, T> {}

impl<'s, T: Copy> ShmQueue<'s, T> {
    // The ring base at offset 320 only guarantees alignments up to 64,
    // and a zero-sized record would make every slot alias.
    const RECORD_CHECK: () = assert!(
        mem::size_of::<T>() != 0 && mem::align_of::<T>() <= 64,
        "record type must be non-zero-sized with alignment at most 64"
    );

    /// Attach to the queue in `seg`, initializing the layout if the
    /// segment is still empty. Uses [`INITIAL_CAPACITY`] on creation.
    pub fn new(seg: &'s mut Segment) -> Result<Self, ShmError> {
        Self::with_initial_capacity(seg, INITIAL_CAPACITY)
    }

    /// Attach with an explicit creation capacity (records, power of two,
    /// at least 2). Only consulted when this handle is the one that
    /// initializes the segment; attaching to a live queue adopts its
    /// authoritative capacity instead.
    ///
    /// # Panics
    /// Panics if `initial` is not a power of two >= 2.
    pub fn with_initial_capacity(seg: &'s mut Segment, initial: u64) -> Result<Self, ShmError> {
        let () = Self::RECORD_CHECK;
        assert!(
            initial.is_power_of_two() && initial >= 2,
            "initial capacity must be a power of two >= 2"
        );

        if seg.size() == 0 {
            seg.resize(layout::segment_len(mem::size_of::<T>(), initial))?;
            // Safety: the fresh mapping covers the whole segment; zeroing
            // it frees all three locks and puts head == tail.
            unsafe { std::ptr::write_bytes(seg.ptr(), 0, seg.size() as usize) };
            let hdr = unsafe { &*(seg.ptr() as *const QueueHeader) };
            hdr.capacity.store(initial, Ordering::Release);
            tracing::debug!(
                capacity = initial,
                bytes = seg.size(),
                "initialized queue segment"
            );
        }

        // Safety: the segment is mapped (at least one page) from here on;
        // ptr()/ptr_at() never return null.
        let hdr = unsafe { NonNull::new_unchecked(seg.ptr() as *mut QueueHeader) };
        let ring = unsafe { NonNull::new_unchecked(seg.ptr_at(layout::RING) as *mut T) };
        let mut queue = ShmQueue {
            global_lock: Spinlock::attach(seg, layout::GLOBAL_LOCK),
            head_lock: Spinlock::attach(seg, layout::HEAD_LOCK),
            tail_lock: Spinlock::attach(seg, layout::TAIL_LOCK),
            hdr,
            ring,
            last_capacity: 0,
            seg,
        };
        // Capacity is never 0, so this re-derives (and, when another
        // process already grew the queue, re-maps) unconditionally.
        queue.rederive();
        Ok(queue)
    }

    fn hdr(&self) -> &QueueHeader {
        // Safety: the mapping is at least a header long from attach
        // onward, and `hdr` is re-derived after every re-map.
        unsafe { self.hdr.as_ref() }
    }

    /// Re-derivation routine: when the capacity this handle last mapped
    /// at disagrees with the authoritative cell, grow our mapping to the
    /// authoritative length and re-grab every cached pointer.
    ///
    /// Idempotent, and safe to call while holding any subset of the
    /// queue's locks: it touches only this handle's mapping, never the
    /// locks themselves.
    ///
    /// A re-map failure here is unrecoverable: the authoritative capacity
    /// has already changed, so the stale pointers must not be used again.
    fn rederive(&mut self) {
        let capacity = self.hdr().capacity.load(Ordering::Acquire);
        if self.last_capacity == capacity {
            return;
        }
        if let Err(e) = self
            .seg
            .resize(layout::segment_len(mem::size_of::<T>(), capacity))
        {
            tracing::error!(capacity, error = %e, "re-map failed after capacity change");
            panic!("shared segment re-map failed: {e}");
        }
        self.global_lock = Spinlock::attach(self.seg, layout::GLOBAL_LOCK);
        self.head_lock = Spinlock::attach(self.seg, layout::HEAD_LOCK);
        self.tail_lock = Spinlock::attach(self.seg, layout::TAIL_LOCK);
        // Safety: resize() succeeded, so the mapping is live and at least
        // segment_len bytes long.
        self.hdr = unsafe { NonNull::new_unchecked(self.seg.ptr() as *mut QueueHeader) };
        self.ring = unsafe { NonNull::new_unchecked(self.seg.ptr_at(layout::RING) as *mut T) };
        self.last_capacity = self.hdr().capacity.load(Ordering::Acquire);
    }

    /// Adopt a capacity change committed through another handle. The
    /// unlocked comparison is only a hint; `rederive` re-reads the
    /// authoritative cell once the global lock is held.
    ///
    /// Caller holds the head or tail lock (both order below global).
    fn catch_up(&mut self) {
        if self.last_capacity != self.hdr().capacity.load(Ordering::Acquire) {
            self.global_lock.acquire();
            self.rederive();
            self.global_lock.release();
        }
    }

    /// Fullness predicate. Caller holds at least the head lock.
    fn is_full(&self) -> bool {
        let hdr = self.hdr();
        let n = hdr.capacity.load(Ordering::Acquire);
        let head = hdr.head.load(Ordering::Acquire);
        (head + 1) & (n - 1) == hdr.tail.load(Ordering::Acquire)
    }

    /// Copy `record` into the head slot and advance head.
    ///
    /// # Safety
    /// Caller holds the head lock and the ring is not full.
    unsafe fn write_slot(&mut self, record: T) {
        let hdr = self.hdr();
        let n = hdr.capacity.load(Ordering::Acquire);
        let head = hdr.head.load(Ordering::Acquire);
        unsafe { self.ring.as_ptr().add(head as usize).write(record) };
        // Release: a consumer that loads the new head must observe the
        // slot contents even though it never takes the head lock.
        hdr.head.store((head + 1) & (n - 1), Ordering::Release);
    }

    /// Doubling protocol. Caller holds head, tail, and global.
    ///
    /// Doubles the authoritative capacity, re-maps, and re-linearizes the
    /// ring: when the valid records wrapped around the old end, the
    /// prefix at the bottom is relocated past the old end so that
    /// `tail..head` is contiguous again. When the full ring happened to
    /// be contiguous already (`tail == 0`), doubling alone un-fulls it
    /// and nothing moves.
    fn grow(&mut self) {
        let old = self.hdr().capacity.load(Ordering::Acquire);
        let new = old << 1;
        self.hdr().capacity.store(new, Ordering::Release);

        // Grows the backing object and re-maps; the ring base may move.
        self.rederive();

        let hdr = self.hdr();
        let head = hdr.head.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Acquire);
        let relocated = if head < tail { head } else { 0 };
        if head < tail {
            // Safety: the wrapped prefix 0..head and its destination
            // old..old+head are disjoint (head <= old - 1), both inside
            // the freshly grown mapping.
            unsafe {
                let base = self.ring.as_ptr();
                std::ptr::copy_nonoverlapping(base, base.add(old as usize), head as usize);
            }
            hdr.head.store(head + old, Ordering::Release);
        }
        tracing::debug!(
            old_capacity = old,
            new_capacity = new,
            relocated,
            "doubled ring capacity"
        );
    }

    /// Append a record, growing the ring when it is full.
    ///
    /// The grow path doubles the authoritative capacity under the global
    /// lock; peers observe the change and re-map on their next operation.
    /// A failure to grow the backing object is unrecoverable and panics.
    pub fn push(&mut self, record: T) {
        self.head_lock.acquire();
        self.catch_up();
        if self.is_full() {
            self.tail_lock.acquire();
            // Re-check under the tail lock, test-and-test-and-set style:
            // a consumer may have drained a slot while we escalated.
            if self.is_full() {
                self.global_lock.acquire();
                self.grow();
                self.global_lock.release();
            }
            self.tail_lock.release();
        }
        // Safety: head lock held; the ring is not full (capacity at
        // least doubled if it was).
        unsafe { self.write_slot(record) };
        self.head_lock.release();
    }

    /// Append a record only if the ring has room; never grows.
    ///
    /// Returns [`QueueFull`] with head, tail, and capacity untouched when
    /// only the reserved slot is left.
    pub fn try_push(&mut self, record: T) -> Result<(), QueueFull> {
        self.head_lock.acquire();
        self.catch_up();
        if self.is_full() {
            self.head_lock.release();
            return Err(QueueFull);
        }
        // Safety: head lock held; the ring is not full.
        unsafe { self.write_slot(record) };
        self.head_lock.release();
        Ok(())
    }

    /// Remove and return the oldest record, or `None` when the queue is
    /// empty.
    ///
    /// Never resizes on its own; it only re-maps to adopt a resize a
    /// producer performed elsewhere.
    pub fn pop(&mut self) -> Option<T> {
        self.tail_lock.acquire();
        self.catch_up();

        let hdr = self.hdr();
        let n = hdr.capacity.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Acquire);
        // The grow path fires one slot early, so head == tail only ever
        // means empty, never full.
        if hdr.head.load(Ordering::Acquire) == tail {
            self.tail_lock.release();
            return None;
        }

        // Safety: tail lock held, and the producer published this slot
        // before its release-store of head.
        let record = unsafe { self.ring.as_ptr().add(tail as usize).read() };
        hdr.tail.store((tail + 1) & (n - 1), Ordering::Release);
        self.tail_lock.release();
        Some(record)
    }

    /// True when the queue held no records at some instant during the
    /// call.
    ///
    /// Lock-free: head and tail are single aligned 64-bit loads, so the
    /// comparison serializes with any concurrent index update. Callers
    /// use this to decide whether to keep spinning, never as a guarantee
    /// about the next `pop`.
    pub fn is_empty(&self) -> bool {
        let hdr = self.hdr();
        hdr.head.load(Ordering::Relaxed) == hdr.tail.load(Ordering::Relaxed)
    }

    /// Advisory occupancy snapshot, with the same caveats as
    /// [`is_empty`](Self::is_empty).
    pub fn len(&self) -> u64 {
        let hdr = self.hdr();
        let n = hdr.capacity.load(Ordering::Relaxed);
        let head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) & (n - 1)
    }

    /// Authoritative ring capacity in records at some instant during the
    /// call. Only ever moves upward, in doublings.
    pub fn capacity(&self) -> u64 {
        self.hdr().capacity.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/shmq-queue-{}-{}", std::process::id(), tag)
    }

    fn fresh(tag: &str) -> Segment {
        Segment::open(&unique(tag)).unwrap()
    }

    #[test]
    fn init_and_single() {
        let mut seg = fresh("single");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::new(&mut seg).unwrap();
            assert_eq!(q.pop(), None);
            q.push(42);
            assert!(!q.is_empty());
            assert_eq!(q.pop(), Some(42));
            assert!(q.is_empty());
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn fresh_segment_defaults() {
        let mut seg = fresh("defaults");
        {
            let q: ShmQueue<'_, u64> = ShmQueue::new(&mut seg).unwrap();
            assert_eq!(q.capacity(), INITIAL_CAPACITY);
            assert!(q.is_empty());
            assert_eq!(q.len(), 0);
        }
        // 320 + 8 * 64 = 832, page-rounded.
        assert_eq!(seg.size(), 4096);
        seg.unlink().unwrap();
    }

    #[test]
    fn wrap_without_resize() {
        let mut seg = fresh("wrap");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            q.push(1);
            q.push(2);
            q.push(3);
            assert_eq!(q.len(), 3);
            assert_eq!(q.pop(), Some(1));
            q.push(4);
            assert_eq!(q.pop(), Some(2));
            assert_eq!(q.pop(), Some(3));
            assert_eq!(q.pop(), Some(4));
            assert_eq!(q.pop(), None);
            assert_eq!(q.capacity(), 4);
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn forced_growth_contiguous() {
        // Fill to the reserved slot without ever popping: the full ring
        // is contiguous, so doubling must not relocate anything.
        let mut seg = fresh("grow");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            q.push(1);
            q.push(2);
            q.push(3);
            assert_eq!(q.capacity(), 4);
            q.push(4);
            assert_eq!(q.capacity(), 8);
            for want in 1..=4 {
                assert_eq!(q.pop(), Some(want));
            }
            assert_eq!(q.pop(), None);
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn wrapped_growth_linearization() {
        // tail = 1, head = 0, records 2,3,4 in flight: the next push must
        // relocate the wrapped prefix past the old end.
        let mut seg = fresh("linearize");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            q.push(1);
            q.push(2);
            q.push(3);
            assert_eq!(q.pop(), Some(1));
            q.push(4);
            assert_eq!(q.len(), 3);
            q.push(5);
            assert_eq!(q.capacity(), 8);
            for want in 2..=5 {
                assert_eq!(q.pop(), Some(want));
            }
            assert_eq!(q.pop(), None);
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn growth_at_default_capacity_boundary() {
        let mut seg = fresh("boundary");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::new(&mut seg).unwrap();
            for i in 0..63 {
                q.push(i);
            }
            // 63 records is the most a 64-slot ring holds.
            assert_eq!(q.capacity(), 64);
            assert_eq!(q.len(), 63);
            q.push(63);
            assert_eq!(q.capacity(), 128);
            for want in 0..64 {
                assert_eq!(q.pop(), Some(want));
            }
            assert_eq!(q.pop(), None);
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn try_push_full_leaves_state_alone() {
        let mut seg = fresh("tryfull");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 2).unwrap();
            assert_eq!(q.try_push(10), Ok(()));
            assert_eq!(q.try_push(11), Err(QueueFull));
            assert_eq!(q.capacity(), 2);
            assert_eq!(q.len(), 1);
            assert_eq!(q.pop(), Some(10));
            assert_eq!(q.try_push(11), Ok(()));
            assert_eq!(q.pop(), Some(11));
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn ordering_across_many_doublings() {
        let mut seg = fresh("doublings");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 2).unwrap();
            for i in 0..1000 {
                q.push(i);
            }
            assert_eq!(q.len(), 1000);
            assert!(q.capacity() >= 1024);
            for want in 0..1000 {
                assert_eq!(q.pop(), Some(want));
            }
            assert!(q.is_empty());
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn interleaved_push_pop_never_reorders() {
        let mut seg = fresh("interleave");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            let mut next_pop = 0;
            let mut next_push = 0;
            // Push in bursts of 5, pop in bursts of 3.
            while next_pop < 200 {
                for _ in 0..5 {
                    q.push(next_push);
                    next_push += 1;
                }
                for _ in 0..3 {
                    if let Some(v) = q.pop() {
                        assert_eq!(v, next_pop);
                        next_pop += 1;
                    }
                }
            }
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn wide_records_round_trip() {
        let mut seg = fresh("wide");
        {
            let mut q: ShmQueue<'_, [u64; 8]> =
                ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            for i in 0..32 {
                q.push([i; 8]);
            }
            for want in 0..32 {
                assert_eq!(q.pop(), Some([want; 8]));
            }
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn header_words_stay_in_range() {
        let mut seg = fresh("invariants");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            for i in 0..100 {
                q.push(i);
                if i % 3 == 0 {
                    q.pop();
                }
                let hdr = q.hdr();
                let n = hdr.capacity.load(Ordering::Relaxed);
                assert!(n.is_power_of_two() && n >= 2);
                assert!(hdr.head.load(Ordering::Relaxed) < n);
                assert!(hdr.tail.load(Ordering::Relaxed) < n);
                assert!(hdr.global_lock.load(Ordering::Relaxed) <= 1);
                assert!(hdr.head_lock.load(Ordering::Relaxed) <= 1);
                assert!(hdr.tail_lock.load(Ordering::Relaxed) <= 1);
                assert!(q.len() < n);
            }
        }
        seg.unlink().unwrap();
    }

    #[test]
    fn reattach_resumes_where_left_off() {
        let mut seg = fresh("reattach");
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            q.push(7);
            q.push(8);
        }
        {
            let mut q: ShmQueue<'_, u64> = ShmQueue::with_initial_capacity(&mut seg, 4).unwrap();
            assert_eq!(q.capacity(), 4);
            assert_eq!(q.pop(), Some(7));
            assert_eq!(q.pop(), Some(8));
            assert_eq!(q.pop(), None);
        }
        seg.unlink().unwrap();
    }
}
