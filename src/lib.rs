//! shm-queue: kernel-bypass IPC through POSIX shared memory.
//!
//! A growable FIFO of fixed-size records exchanged between cooperating
//! processes via a named shared-memory object. All fast-path
//! synchronization is done by spin-locks stored inside the shared region
//! itself; the kernel is only involved when the ring doubles its capacity
//! (grow + re-map) or when a peer re-maps to adopt such a doubling.
//!
//! This crate defines:
//! - The segment handle ([`Segment`]): open/create, map, grow, unlink
//! - The in-segment lock ([`Spinlock`]) and header layout ([`layout`])
//! - The queue engine ([`ShmQueue`]): `push` / `try_push` / `pop`
//!
//! # Example
//!
//! ```no_run
//! use shm_queue::{Segment, ShmQueue};
//!
//! # fn main() -> Result<(), shm_queue::ShmError> {
//! // Producer process
//! let mut seg = Segment::open("/my-queue")?;
//! let mut queue: ShmQueue<'_, u64> = ShmQueue::new(&mut seg)?;
//! queue.push(42);
//!
//! // Consumer process (same name, own mapping)
//! let mut seg = Segment::open("/my-queue")?;
//! let mut queue: ShmQueue<'_, u64> = ShmQueue::new(&mut seg)?;
//! while queue.pop().is_none() {
//!     core::hint::spin_loop();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Either side may start first: whichever peer finds the segment empty
//! initializes the layout, and the other attaches to it. The record type
//! must be a plain fixed-width `Copy` type with no owning references into
//! the sending process.

pub mod error;
pub mod layout;
pub mod queue;
pub mod segment;
pub mod spinlock;

pub use error::{QueueFull, ShmError};
pub use queue::{ShmQueue, INITIAL_CAPACITY};
pub use segment::Segment;
pub use spinlock::Spinlock;
