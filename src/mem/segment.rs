//! The named shared segment: header, future slab, payload free lists.
//!
//! Layout: `[SegmentHeader][future slab][bump arena ...]`. The header is
//! published by storing `ready = 1` after initialization; clients refuse to
//! attach before that. Byte regions handed out by the allocators are owned
//! exclusively by one process until their offset is published through a
//! record or queue, which is what makes the raw write/read helpers sound.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use uuid::Uuid;

use super::{FreeStack, Heap, ShmRecord};
use crate::error::{Result, RuntimeError};

const SEGMENT_MAGIC: u64 = 0x4358_5254_5345_4731; // "CXRTSEG1"
const SEGMENT_VERSION: u32 = 1;

/// Smallest recycled payload block: 1 KiB.
pub const PAYLOAD_MIN_SHIFT: u32 = 10;
/// Size classes 1 KiB … 4 MiB.
pub const PAYLOAD_CLASSES: usize = 13;

/// Segment control block at offset 0.
#[repr(C)]
pub struct SegmentHeader {
    magic: u64,
    version: u32,
    ready: AtomicU32,
    segment_id: [u8; 16],
    size: u64,
    /// Set on `StopRuntime`; observed by waiters in every process.
    shutdown: AtomicU32,
    _pad0: u32,
    heap: Heap,
    future_free: FreeStack,
    future_base: u64,
    future_slots: u32,
    future_slot_size: u32,
    payload_free: [FreeStack; PAYLOAD_CLASSES],
    /// Well-known admin control lane, discovered by every client at init.
    admin_lane_off: AtomicU64,
    /// Worker directory (per-worker injector rings).
    worker_dir_off: AtomicU64,
    /// Globally unique task-id source for this runtime.
    next_task_id: AtomicU64,
}

unsafe impl ShmRecord for SegmentHeader {}

/// A mapped shared segment. Cheap to share behind `Arc`.
pub struct Segment {
    map: MmapMut,
    path: PathBuf,
}

// Safety: all shared mutation goes through atomics or exclusively-owned
// regions per the module contract above.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("path", &self.path).finish()
    }
}

impl Segment {
    /// Create (or re-create) the named segment and initialize its header.
    pub fn create(path: &Path, size: u64, future_slots: u32, future_slot_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        // Safety: the file was just created with the requested length and is
        // only shared through the protocols described in this module.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.fill(0);

        let slab_size = future_slots as u64 * future_slot_size as u64;
        let header_size = std::mem::size_of::<SegmentHeader>() as u64;
        let future_base = (header_size + 63) & !63;
        let heap_start = (future_base + slab_size + 63) & !63;
        if heap_start >= size {
            return Err(RuntimeError::OutOfMemory);
        }

        let seg = Self {
            map,
            path: path.to_path_buf(),
        };
        // Safety: we are the only process touching the region until
        // `ready` is published below.
        let header = unsafe { &mut *(seg.base() as *mut SegmentHeader) };
        header.magic = SEGMENT_MAGIC;
        header.version = SEGMENT_VERSION;
        header.segment_id = *Uuid::new_v4().as_bytes();
        header.size = size;
        header.future_base = future_base;
        header.future_slots = future_slots;
        header.future_slot_size = future_slot_size;
        header.heap.init(heap_start, size);
        header.future_free.init();
        for stack in header.payload_free.iter_mut() {
            stack.init();
        }
        header.next_task_id = AtomicU64::new(1);

        // Seed the future slab free list.
        for slot in 0..future_slots {
            let off = future_base + slot as u64 * future_slot_size as u64;
            header.future_free.push(&seg, off);
        }

        header.ready.store(1, Ordering::Release);
        tracing::info!(
            path = %path.display(),
            size,
            future_slots,
            "created shared segment"
        );
        Ok(seg)
    }

    /// Attach to an existing segment created by a server process.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| RuntimeError::NotInitialized)?;
        // Safety: same mapping contract as `create`.
        let map = unsafe { MmapMut::map_mut(&file).map_err(|_| RuntimeError::NotInitialized)? };
        let seg = Self {
            map,
            path: path.to_path_buf(),
        };
        if seg.map.len() < std::mem::size_of::<SegmentHeader>() {
            return Err(RuntimeError::NotInitialized);
        }
        let header = seg.header();
        if header.magic != SEGMENT_MAGIC
            || header.version != SEGMENT_VERSION
            || header.ready.load(Ordering::Acquire) != 1
        {
            return Err(RuntimeError::NotInitialized);
        }
        Ok(seg)
    }

    /// Remove the backing file of a named segment.
    pub fn unlink(path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    pub fn header(&self) -> &SegmentHeader {
        // Safety: header is initialized before any Segment handle escapes.
        unsafe { &*(self.base() as *const SegmentHeader) }
    }

    pub fn segment_id(&self) -> Uuid {
        Uuid::from_bytes(self.header().segment_id)
    }

    pub fn heap(&self) -> &Heap {
        &self.header().heap
    }

    pub fn next_task_id(&self) -> u64 {
        self.header().next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    // --- shutdown flag -----------------------------------------------------

    pub fn mark_shutdown(&self) {
        self.header().shutdown.store(1, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.header().shutdown.load(Ordering::Acquire) != 0
    }

    // --- well-known offsets ------------------------------------------------

    pub fn set_admin_lane(&self, off: u64) {
        self.header().admin_lane_off.store(off, Ordering::Release);
    }

    pub fn admin_lane(&self) -> Option<u64> {
        match self.header().admin_lane_off.load(Ordering::Acquire) {
            0 => None,
            off => Some(off),
        }
    }

    pub fn set_worker_dir(&self, off: u64) {
        self.header().worker_dir_off.store(off, Ordering::Release);
    }

    pub fn worker_dir(&self) -> Option<u64> {
        match self.header().worker_dir_off.load(Ordering::Acquire) {
            0 => None,
            off => Some(off),
        }
    }

    // --- future slab -------------------------------------------------------

    pub fn alloc_future(&self) -> Result<u64> {
        self.header()
            .future_free
            .pop(self)
            .ok_or(RuntimeError::OutOfMemory)
    }

    pub fn free_future(&self, off: u64) {
        debug_assert!(off >= self.header().future_base);
        self.header().future_free.push(self, off);
    }

    // --- payload blocks ----------------------------------------------------

    fn payload_class(len: u64) -> Result<usize> {
        let shift = 64 - u64::max(len, 1).next_power_of_two().leading_zeros() - 1;
        let class = shift.saturating_sub(PAYLOAD_MIN_SHIFT) as usize;
        if class >= PAYLOAD_CLASSES {
            return Err(RuntimeError::OutOfMemory);
        }
        Ok(class)
    }

    /// Allocate a recycled payload block able to hold `len` bytes.
    pub fn alloc_payload(&self, len: u64) -> Result<u64> {
        let class = Self::payload_class(len)?;
        if let Some(off) = self.header().payload_free[class].pop(self) {
            return Ok(off);
        }
        self.heap().alloc(1u64 << (PAYLOAD_MIN_SHIFT as usize + class), 64)
    }

    pub fn free_payload(&self, off: u64, len: u64) {
        if let Ok(class) = Self::payload_class(len) {
            self.header().payload_free[class].push(self, off);
        }
    }

    // --- raw region access -------------------------------------------------

    /// Copy `data` into the region at `off`. The caller must own the region.
    pub fn write_bytes(&self, off: u64, data: &[u8]) {
        debug_assert!(off as usize + data.len() <= self.map.len());
        // Safety: exclusive ownership of unpublished regions per the module
        // contract.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(off as usize), data.len());
        }
    }

    /// Copy `len` bytes out of the region at `off`.
    pub fn read_bytes(&self, off: u64, len: usize) -> Vec<u8> {
        debug_assert!(off as usize + len <= self.map.len());
        let mut out = vec![0u8; len];
        // Safety: the region was published with a Release store observed by
        // the caller before reading.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(off as usize), out.as_mut_ptr(), len);
        }
        out
    }

    /// Borrow a record previously allocated and initialized at `off`.
    ///
    /// # Safety
    ///
    /// `off` must point at a live, initialized `T` within this segment.
    pub unsafe fn at<T: ShmRecord>(&self, off: u64) -> &T {
        debug_assert!(off as usize + std::mem::size_of::<T>() <= self.map.len());
        &*(self.base().add(off as usize) as *const T)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_segment(slots: u32) -> (tempfile::TempDir, Segment) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let seg = Segment::create(&path, 4 * 1024 * 1024, slots, 256).unwrap();
        (dir, seg)
    }

    #[test]
    fn create_then_attach() {
        let (_dir, seg) = temp_segment(16);
        let other = Segment::attach(seg.path()).unwrap();
        assert_eq!(seg.segment_id(), other.segment_id());
    }

    #[test]
    fn attach_missing_segment_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let err = Segment::attach(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, RuntimeError::NotInitialized));
    }

    #[test]
    fn future_slab_recycles() {
        let (_dir, seg) = temp_segment(2);
        let a = seg.alloc_future().unwrap();
        let b = seg.alloc_future().unwrap();
        assert_ne!(a, b);
        assert!(seg.alloc_future().is_err());
        seg.free_future(a);
        assert_eq!(seg.alloc_future().unwrap(), a);
    }

    #[test]
    fn payload_classes_round_up() {
        let (_dir, seg) = temp_segment(4);
        let off = seg.alloc_payload(1500).unwrap();
        seg.free_payload(off, 1500);
        // 1500 rounds to the 2 KiB class, so the block is reused for 2000.
        assert_eq!(seg.alloc_payload(2000).unwrap(), off);
    }

    #[test]
    fn task_ids_are_unique() {
        let (_dir, seg) = temp_segment(4);
        let a = seg.next_task_id();
        let b = seg.next_task_id();
        assert_ne!(a, b);
    }

    #[test]
    fn bytes_round_trip() {
        let (_dir, seg) = temp_segment(4);
        let off = seg.heap().alloc(64, 8).unwrap();
        seg.write_bytes(off, b"context");
        assert_eq!(seg.read_bytes(off, 7), b"context");
    }
}
