//! Ingress lanes: bounded lock-free rings of future handles.
//!
//! A lane is a multi-producer ring of 8-byte future offsets with per-slot
//! sequence numbers, drained by the single worker the lane is assigned to.
//! The lane header carries the scheduling state (`assigned_worker_id`,
//! `task_count`, `is_enqueued`) described in the scheduler protocol: the
//! producer that moves `task_count` from 0 to 1 sets `is_enqueued` and
//! delivers the lane to its worker's injector ring; the worker that drains
//! it to 0 clears the flag.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, RuntimeError};
use crate::mem::{Segment, ShmRecord, ShmRef};
use crate::task::{ContainerId, PoolId, WorkerId};

/// One ring slot: Vyukov sequence word plus the stored value.
#[repr(C)]
struct Slot {
    seq: AtomicU64,
    value: AtomicU64,
}

/// Bounded MPMC ring; slots are laid out immediately after the struct.
#[repr(C)]
pub struct Ring {
    capacity: u32,
    _pad: u32,
    head: AtomicU64,
    tail: AtomicU64,
}

unsafe impl ShmRecord for Ring {}

impl Ring {
    pub const fn bytes_for(capacity: u32) -> u64 {
        (std::mem::size_of::<Ring>() + capacity as usize * std::mem::size_of::<Slot>()) as u64
    }

    /// Initialize a ring in place. `capacity` must be a power of two.
    ///
    /// # Safety
    ///
    /// `off` must address an exclusively owned region of at least
    /// [`Ring::bytes_for`] bytes.
    pub unsafe fn init_at(seg: &Segment, off: u64, capacity: u32) {
        debug_assert!(capacity.is_power_of_two());
        let ring = &mut *(seg.base().add(off as usize) as *mut Ring);
        ring.capacity = capacity;
        ring.head = AtomicU64::new(0);
        ring.tail = AtomicU64::new(0);
        let slots = (ring as *mut Ring as *mut u8).add(std::mem::size_of::<Ring>()) as *mut Slot;
        for i in 0..capacity as u64 {
            let slot = &mut *slots.add(i as usize);
            slot.seq = AtomicU64::new(i);
            slot.value = AtomicU64::new(0);
        }
    }

    fn slot(&self, pos: u64) -> &Slot {
        let mask = (self.capacity - 1) as u64;
        // Safety: slots were initialized contiguously after the header by
        // `init_at`.
        unsafe {
            let base =
                (self as *const Ring as *const u8).add(std::mem::size_of::<Ring>()) as *const Slot;
            &*base.add((pos & mask) as usize)
        }
    }

    /// Multi-producer push. Returns false when the ring is full.
    pub fn try_push(&self, value: u64) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(tail);
            let seq = slot.seq.load(Ordering::Acquire);
            match (seq as i64).wrapping_sub(tail as i64) {
                0 => {
                    match self.tail.compare_exchange_weak(
                        tail,
                        tail.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            slot.value.store(value, Ordering::Relaxed);
                            slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                            return true;
                        }
                        Err(actual) => tail = actual,
                    }
                }
                diff if diff < 0 => return false,
                _ => tail = self.tail.load(Ordering::Relaxed),
            }
        }
    }

    /// Consumer pop. Safe for concurrent consumers, used single-consumer.
    pub fn try_pop(&self) -> Option<u64> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(head);
            let seq = slot.seq.load(Ordering::Acquire);
            match (seq as i64).wrapping_sub(head.wrapping_add(1) as i64) {
                0 => {
                    match self.head.compare_exchange_weak(
                        head,
                        head.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            let value = slot.value.load(Ordering::Relaxed);
                            slot.seq.store(
                                head.wrapping_add(self.capacity as u64),
                                Ordering::Release,
                            );
                            return Some(value);
                        }
                        Err(actual) => head = actual,
                    }
                }
                diff if diff < 0 => return None,
                _ => head = self.head.load(Ordering::Relaxed),
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Per-lane scheduling header, followed in memory by the handle ring.
#[repr(C)]
pub struct LaneHeader {
    pool_major: u32,
    pool_minor: u32,
    container_id: u32,
    lane_index: u32,
    assigned_worker: AtomicU32,
    task_count: AtomicU32,
    is_enqueued: AtomicU32,
    _pad: u32,
    ring: Ring,
}

unsafe impl ShmRecord for LaneHeader {}

impl LaneHeader {
    pub fn pool(&self) -> PoolId {
        PoolId::new(self.pool_major, self.pool_minor)
    }

    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    pub fn lane_index(&self) -> u32 {
        self.lane_index
    }

    pub fn assigned_worker(&self) -> WorkerId {
        self.assigned_worker.load(Ordering::Acquire)
    }

    /// Hand the lane to another worker. Returns the previous owner on
    /// success; fails if a concurrent handover won.
    pub fn try_reassign(&self, from: WorkerId, to: WorkerId) -> std::result::Result<WorkerId, WorkerId> {
        self.assigned_worker
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn is_enqueued(&self) -> bool {
        self.is_enqueued.load(Ordering::Acquire) != 0
    }
}

/// Typed handle to a lane in the segment.
#[derive(Debug, Clone, Copy)]
pub struct Lane {
    off: u64,
}

impl Lane {
    /// Allocate and initialize a lane from the segment heap.
    pub fn create(
        seg: &Segment,
        pool: PoolId,
        container_id: ContainerId,
        lane_index: u32,
        worker: WorkerId,
        capacity: u32,
    ) -> Result<Lane> {
        let bytes = std::mem::size_of::<LaneHeader>() as u64
            - std::mem::size_of::<Ring>() as u64
            + Ring::bytes_for(capacity);
        let off = seg.heap().alloc(bytes, 64)?;
        // Safety: freshly allocated, exclusively owned until returned.
        unsafe {
            let header = &mut *(seg.base().add(off as usize) as *mut LaneHeader);
            header.pool_major = pool.major;
            header.pool_minor = pool.minor;
            header.container_id = container_id;
            header.lane_index = lane_index;
            header.assigned_worker = AtomicU32::new(worker);
            header.task_count = AtomicU32::new(0);
            header.is_enqueued = AtomicU32::new(0);
            let ring_off = off + (std::mem::size_of::<LaneHeader>() as u64
                - std::mem::size_of::<Ring>() as u64);
            Ring::init_at(seg, ring_off, capacity);
        }
        Ok(Lane { off })
    }

    pub fn from_offset(off: u64) -> Lane {
        Lane { off }
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn header<'s>(&self, seg: &'s Segment) -> &'s LaneHeader {
        ShmRef::<LaneHeader>::from_offset(self.off).resolve(seg)
    }

    /// Enqueue a future handle. On success reports whether this push must
    /// also deliver the lane to its worker (the 0→1 `task_count`
    /// transition that won the `is_enqueued` flag).
    pub fn push(&self, seg: &Segment, handle: u64) -> std::result::Result<bool, RuntimeError> {
        let header = self.header(seg);
        if !header.ring.try_push(handle) {
            return Err(RuntimeError::QueueFull);
        }
        header.task_count.fetch_add(1, Ordering::AcqRel);
        let deliver = header
            .is_enqueued
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        Ok(deliver)
    }

    /// Dequeue one future handle (owning worker only).
    pub fn pop(&self, seg: &Segment) -> Option<u64> {
        let header = self.header(seg);
        let handle = header.ring.try_pop()?;
        header.task_count.fetch_sub(1, Ordering::AcqRel);
        Some(handle)
    }

    /// Clear `is_enqueued` after draining. Returns true if new tasks raced
    /// in and the lane re-won the flag (caller must keep scanning it).
    pub fn finish_drain(&self, seg: &Segment) -> bool {
        let header = self.header(seg);
        header.is_enqueued.store(0, Ordering::Release);
        if header.task_count.load(Ordering::Acquire) > 0 {
            return header
                .is_enqueued
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        false
    }

    /// Wake path: re-enqueue a handle on a lane known only by offset, and
    /// deliver the lane to its assigned worker if needed. Used by task
    /// wakers and cross-process cancellation; a persistently full ring drops
    /// the nudge (the flag on the record survives, so the next visit
    /// observes it).
    pub fn push_from_offset(seg: &Segment, lane_off: u64, handle: u64) {
        let lane = Lane::from_offset(lane_off);
        for _ in 0..1024 {
            match lane.push(seg, handle) {
                Ok(deliver) => {
                    if deliver {
                        WorkerBoard::deliver(seg, lane.header(seg).assigned_worker(), lane_off);
                    }
                    return;
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
        tracing::warn!(lane_off, handle, "dropped wake nudge into full lane");
    }
}

/// Per-worker injector rings in the segment, discovered via the header.
///
/// Producers (any process) deliver newly enqueued lanes here; each worker
/// drains only its own ring.
pub struct WorkerBoard;

#[repr(C)]
struct WorkerDirHeader {
    num_workers: u32,
    ring_capacity: u32,
}

impl WorkerBoard {
    fn entry_bytes(ring_capacity: u32) -> u64 {
        let unaligned = Ring::bytes_for(ring_capacity);
        (unaligned + 63) & !63
    }

    /// Allocate the worker directory and publish it in the segment header.
    pub fn create(seg: &Segment, num_workers: u32, ring_capacity: u32) -> Result<()> {
        let bytes = std::mem::size_of::<WorkerDirHeader>() as u64
            + num_workers as u64 * Self::entry_bytes(ring_capacity);
        let off = seg.heap().alloc(bytes + 64, 64)?;
        // Safety: freshly allocated region.
        unsafe {
            let dir = &mut *(seg.base().add(off as usize) as *mut WorkerDirHeader);
            dir.num_workers = num_workers;
            dir.ring_capacity = ring_capacity;
            for worker in 0..num_workers {
                Ring::init_at(seg, Self::ring_off(off, worker, ring_capacity), ring_capacity);
            }
        }
        seg.set_worker_dir(off);
        Ok(())
    }

    fn ring_off(dir_off: u64, worker: u32, ring_capacity: u32) -> u64 {
        let base = dir_off + 64;
        base + worker as u64 * Self::entry_bytes(ring_capacity)
    }

    fn dir(seg: &Segment) -> Option<(u64, u32, u32)> {
        let off = seg.worker_dir()?;
        // Safety: published by `create`.
        let dir = unsafe { &*(seg.base().add(off as usize) as *const WorkerDirHeader) };
        Some((off, dir.num_workers, dir.ring_capacity))
    }

    /// Deliver a lane to `worker`'s injector ring.
    pub fn deliver(seg: &Segment, worker: WorkerId, lane_off: u64) {
        let Some((dir_off, num_workers, cap)) = Self::dir(seg) else {
            return;
        };
        let worker = worker % num_workers.max(1);
        let ring_off = Self::ring_off(dir_off, worker, cap);
        // Safety: rings were initialized by `create`.
        let ring = unsafe { seg.at::<Ring>(ring_off) };
        if !ring.try_push(lane_off) {
            tracing::warn!(worker, lane_off, "worker injector ring full");
        }
    }

    /// Drain one lane offset from `worker`'s injector ring.
    pub fn drain(seg: &Segment, worker: WorkerId) -> Option<u64> {
        let (dir_off, num_workers, cap) = Self::dir(seg)?;
        if worker >= num_workers {
            return None;
        }
        let ring_off = Self::ring_off(dir_off, worker, cap);
        // Safety: rings were initialized by `create`.
        let ring = unsafe { seg.at::<Ring>(ring_off) };
        ring.try_pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_segment() -> (tempfile::TempDir, Arc<Segment>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let seg = Segment::create(&path, 8 * 1024 * 1024, 64, 256).unwrap();
        (dir, Arc::new(seg))
    }

    #[test]
    fn lane_push_pop_fifo() {
        let (_dir, seg) = temp_segment();
        let lane = Lane::create(&seg, PoolId::new(1, 0), 0, 0, 0, 8).unwrap();
        assert!(lane.push(&seg, 10).unwrap(), "first push delivers");
        assert!(!lane.push(&seg, 20).unwrap(), "second push does not");
        assert_eq!(lane.header(&seg).task_count(), 2);
        assert_eq!(lane.pop(&seg), Some(10));
        assert_eq!(lane.pop(&seg), Some(20));
        assert_eq!(lane.pop(&seg), None);
        assert!(!lane.finish_drain(&seg));
        assert!(!lane.header(&seg).is_enqueued());
    }

    #[test]
    fn lane_full_surfaces_queue_full() {
        let (_dir, seg) = temp_segment();
        let lane = Lane::create(&seg, PoolId::new(1, 0), 0, 0, 0, 4).unwrap();
        for handle in 0..4 {
            lane.push(&seg, handle).unwrap();
        }
        assert!(matches!(lane.push(&seg, 99), Err(RuntimeError::QueueFull)));
        // Deterministically full until the consumer drains.
        assert!(matches!(lane.push(&seg, 99), Err(RuntimeError::QueueFull)));
        lane.pop(&seg).unwrap();
        lane.push(&seg, 99).unwrap();
    }

    #[test]
    fn finish_drain_rewins_on_race() {
        let (_dir, seg) = temp_segment();
        let lane = Lane::create(&seg, PoolId::new(1, 0), 0, 0, 0, 8).unwrap();
        assert!(lane.push(&seg, 1).unwrap());
        assert_eq!(lane.pop(&seg), Some(1));
        // A producer races in before the worker clears the flag: its push
        // sees is_enqueued still set and does not deliver.
        assert!(!lane.push(&seg, 2).unwrap());
        // finish_drain must then re-win the flag so the lane stays scanned.
        assert!(lane.finish_drain(&seg));
        assert!(lane.header(&seg).is_enqueued());
        assert_eq!(lane.pop(&seg), Some(2));
    }

    #[test]
    fn concurrent_producers_preserve_all_handles() {
        let (_dir, seg) = temp_segment();
        let lane = Lane::create(&seg, PoolId::new(1, 0), 0, 0, 0, 1024).unwrap();
        let mut joins = Vec::new();
        for producer in 0..4u64 {
            let seg = Arc::clone(&seg);
            joins.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    while lane.push(&seg, producer * 1000 + i + 1).is_err() {
                        std::hint::spin_loop();
                    }
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        while let Some(handle) = lane.pop(&seg) {
            assert!(seen.insert(handle), "duplicate handle {handle}");
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn worker_board_routes_by_worker() {
        let (_dir, seg) = temp_segment();
        WorkerBoard::create(&seg, 2, 64).unwrap();
        WorkerBoard::deliver(&seg, 0, 111);
        WorkerBoard::deliver(&seg, 1, 222);
        assert_eq!(WorkerBoard::drain(&seg, 0), Some(111));
        assert_eq!(WorkerBoard::drain(&seg, 0), None);
        assert_eq!(WorkerBoard::drain(&seg, 1), Some(222));
    }
}
