//! Busy-wait locks stored inside a shared segment.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::segment::Segment;

/// A spin-lock overlaid on an 8-byte cell of a [`Segment`].
///
/// The cell holds 0 when free and 1 when held. The overlay itself carries
/// no state beyond the cell's address; it is re-attached whenever the
/// segment is re-mapped.
///
/// *Not* recursive: a holder that acquires again deadlocks. Never yields
/// to the scheduler while waiting. The cell should sit on its own cache
/// line to avoid false sharing; working out the alignment is the caller's
/// responsibility (the queue layout guarantees it). Locking hierarchy is
/// likewise the caller's responsibility.
pub struct Spinlock {
    cell: NonNull<AtomicU64>,
}

impl Spinlock {
    /// Overlay the 8-byte cell at `offset` into the segment's mapping.
    ///
    /// No memory is touched. The cell is *not* zeroed here; whichever
    /// peer initializes the segment must [`zero`](Self::zero) each lock
    /// exactly once before anyone acquires it.
    pub fn attach(seg: &Segment, offset: u64) -> Self {
        let p = seg.ptr_at(offset) as *mut AtomicU64;
        debug_assert!(p as usize % 8 == 0, "lock cell must be 8-byte aligned");
        // Safety: ptr_at yields a non-null pointer into the live mapping.
        Spinlock {
            cell: unsafe { NonNull::new_unchecked(p) },
        }
    }

    fn cell(&self) -> &AtomicU64 {
        // Safety: the overlay is only used while the mapping it was
        // attached to is current; holders re-attach after every re-map.
        unsafe { self.cell.as_ref() }
    }

    /// Store 0 into the cell, making the lock free.
    pub fn zero(&self) {
        self.cell().store(0, Ordering::Release);
    }

    /// Busy-wait until the lock is held.
    ///
    /// Test-and-test-and-set: spin on relaxed loads while the cell is
    /// nonzero, then attempt one atomic exchange of 1. The successful
    /// exchange carries acquire ordering, so every store the previous
    /// holder made before [`release`](Self::release) is visible.
    pub fn acquire(&self) {
        let cell = self.cell();
        loop {
            while cell.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
            if cell.swap(1, Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    /// Release the lock. Does not check that the caller holds it.
    pub fn release(&self) {
        self.cell().store(0, Ordering::Release);
    }
}
