//! Shared-memory segment management.
//!
//! The segment is the only mutable region shared between processes. All
//! cross-process pointers are byte offsets from the segment base so the
//! mapping address may differ per process. Coarse objects come from a
//! monotonic bump arena; future records and payload blocks are recycled
//! through in-segment free lists.

mod heap;
mod segment;
mod shm_ptr;

pub use heap::{FreeStack, Heap};
pub use segment::{Segment, SegmentHeader, PAYLOAD_CLASSES, PAYLOAD_MIN_SHIFT};
pub use shm_ptr::{ShmRecord, ShmRef};
