// src/layout.rs

use std::sync::atomic::AtomicU64;

/// Byte offset of the global lock. Taken to mutate the authoritative
/// capacity (and with it the mapping topology of every participant).
pub const GLOBAL_LOCK: u64 = 0;
/// Byte offset of the authoritative element count. Always a power of two
/// >= 2 for the lifetime of the segment.
pub const CAPACITY: u64 = 8;
/// Byte offset of the producer-side lock.
pub const HEAD_LOCK: u64 = 64;
/// Byte offset of the consumer-side lock.
pub const TAIL_LOCK: u64 = 128;
/// Byte offset of the head index: the next slot a producer writes.
pub const HEAD: u64 = 192;
/// Byte offset of the tail index: the next slot a consumer reads.
pub const TAIL: u64 = 256;
/// Byte offset of the first ring slot.
pub const RING: u64 = 320;

/// In-segment queue header (320 bytes, every word on its own cache line).
///
/// These offsets are a cross-process wire format: any peer opening the
/// segment must address the same fields at the same offsets, regardless of
/// implementation language. The struct below mirrors that contract and the
/// assertions pin it; the toolchain is never allowed to decide the layout.
///
/// Each word sits on its own 64-byte cache line so the producer (head),
/// the consumer (tail), and resizers (global/capacity) never false-share.
#[repr(C, align(64))]
pub struct QueueHeader {
    /// 0 ⇔ free, 1 ⇔ held. Guards `capacity` and all remapping.
    pub global_lock: AtomicU64,
    /// Element count of the ring. Only mutated under all three locks.
    pub capacity: AtomicU64,
    _pad0: [u8; 48],
    /// Guards `head` and ring writes.
    pub head_lock: AtomicU64,
    _pad1: [u8; 56],
    /// Guards `tail` and ring reads.
    pub tail_lock: AtomicU64,
    _pad2: [u8; 56],
    /// Next write slot, in `[0, capacity)`.
    pub head: AtomicU64,
    _pad3: [u8; 56],
    /// Next read slot, in `[0, capacity)`.
    pub tail: AtomicU64,
    _pad4: [u8; 56],
}

// Compile-time layout pins. The header is the wire format.
const _: () = {
    use std::mem::{align_of, offset_of, size_of};
    assert!(size_of::<QueueHeader>() as u64 == RING);
    assert!(align_of::<QueueHeader>() == 64);
    assert!(offset_of!(QueueHeader, global_lock) as u64 == GLOBAL_LOCK);
    assert!(offset_of!(QueueHeader, capacity) as u64 == CAPACITY);
    assert!(offset_of!(QueueHeader, head_lock) as u64 == HEAD_LOCK);
    assert!(offset_of!(QueueHeader, tail_lock) as u64 == TAIL_LOCK);
    assert!(offset_of!(QueueHeader, head) as u64 == HEAD);
    assert!(offset_of!(QueueHeader, tail) as u64 == TAIL);
};

/// Total segment length in bytes for a ring of `nelem` records of
/// `elem_size` bytes each (header included, before page rounding).
pub const fn segment_len(elem_size: usize, nelem: u64) -> u64 {
    RING + elem_size as u64 * nelem
}
