//! Shared-memory completion records ("futures").
//!
//! A future record is allocated from the segment slab at submission, moves
//! monotonically through `pending → running → (ready | error | cancelled)`,
//! and is recycled only after both the submitter's handle and the runtime
//! have released it. Any process that can map the segment may await it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, Result, RuntimeError};
use crate::mem::{Segment, ShmRecord, ShmRef};
use crate::task::{ContainerId, LocalArchive, MethodId, PoolId, TaskId, TaskOutput};

/// Fixed slab slot size for future records.
pub const FUTURE_SLOT_SIZE: u32 = 256;

/// Future record flag bits.
pub mod flags {
    /// Payload lives in the process-local archive, not the segment.
    pub const LOCAL_PAYLOAD: u32 = 1 << 0;
    /// Task is re-armed by its worker after each completion.
    pub const PERIODIC: u32 = 1 << 1;
    /// Cancellation was requested; observed at the next suspension point.
    pub const CANCEL_REQUESTED: u32 = 1 << 2;
    /// Handle re-enqueued by a waker; consumed by the claiming worker.
    pub const WOKEN: u32 = 1 << 3;
    /// No client handle exists; the runtime holds the only reference.
    pub const DETACHED: u32 = 1 << 4;
}

/// Future state machine. Stored as a u32 in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FutureState {
    Pending = 0,
    Running = 1,
    Ready = 2,
    Error = 3,
    Cancelled = 4,
}

impl FutureState {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Ready,
            3 => Self::Error,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Cancelled)
    }
}

/// The shared completion record.
#[repr(C)]
pub struct FutureRecord {
    state: AtomicU32,
    error_code: AtomicU32,
    refcount: AtomicU32,
    flags: AtomicU32,
    task_id: u64,
    pool_major: u32,
    pool_minor: u32,
    container_id: u32,
    method: u32,
    /// Lane carrying this task; wake re-enqueues through it.
    lane_off: AtomicU64,
    period_us: u64,
    input_off: AtomicU64,
    input_len: AtomicU32,
    _pad0: u32,
    output_off: AtomicU64,
    output_len: AtomicU32,
    _pad1: u32,
}

unsafe impl ShmRecord for FutureRecord {}

const _: () = assert!(std::mem::size_of::<FutureRecord>() <= FUTURE_SLOT_SIZE as usize);

/// Submission-time fields of a future record.
pub struct FutureInit {
    pub task_id: TaskId,
    pub pool: PoolId,
    pub container_id: ContainerId,
    pub method: MethodId,
    pub flags: u32,
    pub period_us: u64,
}

impl FutureRecord {
    /// Initialize a freshly allocated (possibly recycled) slot.
    pub fn init_at(seg: &Segment, off: u64, init: FutureInit) -> ShmRef<FutureRecord> {
        // Safety: the slot was just popped from the free list, so this
        // process owns it exclusively until the offset is published.
        let rec = unsafe { &mut *(seg.base().add(off as usize) as *mut FutureRecord) };
        rec.state = AtomicU32::new(FutureState::Pending as u32);
        rec.error_code = AtomicU32::new(ErrorCode::Ok as u32);
        let refs = if init.flags & flags::DETACHED != 0 { 1 } else { 2 };
        rec.refcount = AtomicU32::new(refs);
        rec.flags = AtomicU32::new(init.flags);
        rec.task_id = init.task_id;
        rec.pool_major = init.pool.major;
        rec.pool_minor = init.pool.minor;
        rec.container_id = init.container_id;
        rec.method = init.method;
        rec.lane_off = AtomicU64::new(0);
        rec.period_us = init.period_us;
        rec.input_off = AtomicU64::new(0);
        rec.input_len = AtomicU32::new(0);
        rec.output_off = AtomicU64::new(0);
        rec.output_len = AtomicU32::new(0);
        ShmRef::from_offset(off)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn pool(&self) -> PoolId {
        PoolId::new(self.pool_major, self.pool_minor)
    }

    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    pub fn state(&self) -> FutureState {
        FutureState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_u32(self.error_code.load(Ordering::Acquire))
    }

    // --- flag helpers ------------------------------------------------------

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags() & bit != 0
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Mark woken exactly once; the worker clears it when it claims the
    /// handle. Prevents duplicate re-enqueues from racing wakers.
    pub fn try_mark_woken(&self) -> bool {
        self.flags.fetch_or(flags::WOKEN, Ordering::AcqRel) & flags::WOKEN == 0
    }

    // --- state transitions -------------------------------------------------

    /// pending → running, performed by the claiming worker.
    pub fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                FutureState::Pending as u32,
                FutureState::Running as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// pending → cancelled, performed by `cancel` before the task starts.
    pub fn try_cancel_pending(&self) -> bool {
        self.state
            .compare_exchange(
                FutureState::Pending as u32,
                FutureState::Cancelled as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Re-arm a periodic task for its next firing.
    pub fn rearm(&self) {
        self.output_len.store(0, Ordering::Release);
        self.state
            .store(FutureState::Pending as u32, Ordering::Release);
    }

    /// Publish a terminal state. Output payload (if any) must be written
    /// before this.
    pub fn finish(&self, state: FutureState, code: ErrorCode) {
        debug_assert!(state.is_terminal());
        self.error_code.store(code as u32, Ordering::Release);
        self.state.store(state as u32, Ordering::Release);
    }

    // --- payload slots -----------------------------------------------------

    pub fn set_input(&self, off: u64, len: u32) {
        self.input_off.store(off, Ordering::Release);
        self.input_len.store(len, Ordering::Release);
    }

    pub fn input(&self) -> (u64, u32) {
        (
            self.input_off.load(Ordering::Acquire),
            self.input_len.load(Ordering::Acquire),
        )
    }

    pub fn set_output(&self, off: u64, len: u32) {
        self.output_off.store(off, Ordering::Release);
        self.output_len.store(len, Ordering::Release);
    }

    pub fn output(&self) -> (u64, u32) {
        (
            self.output_off.load(Ordering::Acquire),
            self.output_len.load(Ordering::Acquire),
        )
    }

    // --- lane back-reference ----------------------------------------------

    pub fn set_lane(&self, off: u64) {
        self.lane_off.store(off, Ordering::Release);
    }

    pub fn lane(&self) -> u64 {
        self.lane_off.load(Ordering::Acquire)
    }

    // --- reference counting ------------------------------------------------

    pub fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this release dropped the last reference.
    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Release one reference to the record at `off`, reclaiming it (payloads,
/// local archive entry, slab slot) when this was the last.
pub fn release_ref(seg: &Segment, local: &LocalArchive, off: u64) {
    // Safety: callers hold a counted reference, so the slot is live.
    let rec = unsafe { seg.at::<FutureRecord>(off) };
    if !rec.release() {
        return;
    }
    let (input_off, input_len) = rec.input();
    if input_off != 0 {
        seg.free_payload(input_off, input_len as u64);
    }
    let (output_off, output_len) = rec.output();
    if output_off != 0 {
        seg.free_payload(output_off, output_len as u64);
    }
    local.remove(off);
    seg.free_future(off);
}

/// Same-process waiter registry: completions wake registered wakers and
/// pulse the condvar for blocking waiters. Cross-process waiters fall back
/// to timed polling of the shared state word.
#[derive(Default)]
pub struct CompletionBoard {
    waiters: Mutex<std::collections::HashMap<u64, Vec<Waker>>>,
    cv: Condvar,
}

impl CompletionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, off: u64, waker: &Waker) {
        let mut waiters = self.waiters.lock().unwrap();
        let entry = waiters.entry(off).or_default();
        if !entry.iter().any(|w| w.will_wake(waker)) {
            entry.push(waker.clone());
        }
    }

    pub fn notify(&self, off: u64) {
        let woken = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.remove(&off)
        };
        if let Some(wakers) = woken {
            for waker in wakers {
                waker.wake();
            }
        }
        self.cv.notify_all();
    }

    fn wait_tick(&self, timeout: Duration) {
        let guard = self.waiters.lock().unwrap();
        let _ = self.cv.wait_timeout(guard, timeout).unwrap();
    }
}

/// Client-side handle to a submitted task.
pub struct TaskFuture {
    seg: Arc<Segment>,
    board: Arc<CompletionBoard>,
    local: Arc<LocalArchive>,
    off: u64,
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture").field("off", &self.off).finish()
    }
}

impl TaskFuture {
    pub(crate) fn new(
        seg: Arc<Segment>,
        board: Arc<CompletionBoard>,
        local: Arc<LocalArchive>,
        off: u64,
    ) -> Self {
        Self {
            seg,
            board,
            local,
            off,
        }
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    fn record(&self) -> &FutureRecord {
        // Safety: the handle holds a counted reference.
        unsafe { self.seg.at::<FutureRecord>(self.off) }
    }

    pub fn task_id(&self) -> TaskId {
        self.record().task_id()
    }

    pub fn state(&self) -> FutureState {
        self.record().state()
    }

    /// Non-blocking poll of the completion state.
    pub fn poll_state(&self) -> Poll<Result<()>> {
        match self.record().state() {
            FutureState::Pending | FutureState::Running => Poll::Pending,
            FutureState::Ready => Poll::Ready(Ok(())),
            FutureState::Cancelled => Poll::Ready(Err(RuntimeError::Cancelled)),
            FutureState::Error => {
                Poll::Ready(Err(RuntimeError::from_code(self.record().error_code())))
            }
        }
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Block with a deadline. Expiry surfaces `timeout` without affecting
    /// the task.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<()> {
        let mut spins = 0u32;
        loop {
            if let Poll::Ready(result) = self.poll_state() {
                return result;
            }
            if self.seg.is_shutdown() {
                return Err(RuntimeError::RuntimeShutdown);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RuntimeError::Timeout);
                }
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                self.board.wait_tick(Duration::from_millis(1));
            }
        }
    }

    /// Take the result payload of a `Ready` future.
    pub fn output(&self) -> Result<TaskOutput> {
        match self.poll_state() {
            Poll::Pending => Err(RuntimeError::Timeout),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Ready(Ok(())) => {
                let rec = self.record();
                if rec.has_flag(flags::LOCAL_PAYLOAD) {
                    self.local
                        .take_output(self.off)
                        .map(TaskOutput::Local)
                        .ok_or_else(|| RuntimeError::Serde("result already taken".into()))
                } else {
                    let (off, len) = rec.output();
                    let bytes = if off == 0 {
                        Vec::new()
                    } else {
                        self.seg.read_bytes(off, len as usize)
                    };
                    Ok(TaskOutput::Wire(bytes))
                }
            }
        }
    }

    /// Request cancellation. The claiming worker turns a still-pending
    /// task terminal on its next dequeue; a running task observes the
    /// request at its next suspension point. Never silent: the future
    /// always reaches a terminal state.
    pub fn cancel(&self) {
        let rec = self.record();
        rec.set_flag(flags::CANCEL_REQUESTED);
        // A pending task's handle is already queued; only a suspended task
        // needs a nudge so its worker revisits it.
        if rec.state() == FutureState::Running {
            let lane_off = rec.lane();
            if lane_off != 0 && rec.try_mark_woken() {
                crate::ipc::Lane::push_from_offset(&self.seg, lane_off, self.off);
            }
        }
    }

    /// Await completion from inside another task.
    pub fn join(&self) -> JoinFuture<'_> {
        JoinFuture { future: self }
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        release_ref(&self.seg, &self.local, self.off);
    }
}

/// Future adapter for awaiting a [`TaskFuture`] inside a cooperative task.
pub struct JoinFuture<'a> {
    future: &'a TaskFuture,
}

impl std::future::Future for JoinFuture<'_> {
    type Output = Result<()>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        match self.future.poll_state() {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                self.future.board.register(self.future.off, cx.waker());
                // Re-check: completion may have raced the registration.
                match self.future.poll_state() {
                    Poll::Ready(result) => Poll::Ready(result),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
