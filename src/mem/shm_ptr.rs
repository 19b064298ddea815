//! Typed offset handles into the shared segment.
//!
//! A [`ShmRef<T>`] stores a byte offset from the segment base instead of a
//! raw pointer, so it stays valid across processes that map the segment at
//! different addresses. Resolution borrows the segment, which pins the
//! mapping for the lifetime of the returned reference.

use std::marker::PhantomData;

use super::Segment;

/// Marker for types that may live inside the shared segment.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references
/// (only plain data and atomics), and tolerate being observed concurrently
/// from multiple processes under the protocol documented at their
/// definition.
pub unsafe trait ShmRecord: Sized + Sync {}

/// A typed byte-offset handle, relocatable across process mappings.
pub struct ShmRef<T> {
    off: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ShmRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ShmRef<T> {}

impl<T> std::fmt::Debug for ShmRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmRef({:#x})", self.off)
    }
}

impl<T: ShmRecord> ShmRef<T> {
    /// Wrap a raw offset. The offset must point at a live, initialized `T`
    /// inside the segment (callers get offsets from the allocators or from
    /// other records, never by arithmetic).
    pub fn from_offset(off: u64) -> Self {
        debug_assert!(off != 0, "null shm offset");
        Self {
            off,
            _marker: PhantomData,
        }
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Borrow the record inside `seg`.
    pub fn resolve<'s>(&self, seg: &'s Segment) -> &'s T {
        // Safety: construction guarantees the offset points at an
        // initialized T within the mapping, and ShmRecord bounds what T can
        // contain.
        unsafe { &*(seg.base().add(self.off as usize) as *const T) }
    }
}
