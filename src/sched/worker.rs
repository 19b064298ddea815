//! The worker loop: lane scanning, task polling, parking, idle backoff.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::ipc::{IpcFabric, Lane, OutputPayload, WorkerBoard};
use crate::mem::Segment;
use crate::module::{AnyOut, CancelToken, PoolManager, RunContext, TaskBody};
use crate::task::{flags, release_ref, FutureRecord, WorkerId};

use super::pool::{SchedControl, WorkerStats};

struct Suspended {
    body: TaskBody,
    parked_by: WorkerId,
}

/// Registry of parked task bodies, shared by all workers so a lane can
/// migrate while its tasks are suspended.
#[derive(Clone, Default)]
pub(super) struct SuspendedTasks(Arc<Mutex<HashMap<u64, Suspended>>>);

impl SuspendedTasks {
    fn park(&self, off: u64, body: TaskBody, worker: WorkerId) {
        self.0.lock().unwrap().insert(
            off,
            Suspended {
                body,
                parked_by: worker,
            },
        );
    }

    fn claim(&self, off: u64) -> Option<Suspended> {
        self.0.lock().unwrap().remove(&off)
    }

    /// Drop every parked body and return their future offsets (shutdown).
    pub(super) fn drain_offsets(&self) -> Vec<u64> {
        let mut map = self.0.lock().unwrap();
        let offs = map.keys().copied().collect();
        map.clear();
        offs
    }
}

/// Waker for a suspended task: flags the record woken (once) and re-enqueues
/// its handle on the lane it lives on.
struct TaskWaker {
    seg: Arc<Segment>,
    control: Arc<SchedControl>,
    fut_off: u64,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // Safety: wakers only exist while the runtime holds a reference.
        let rec = unsafe { self.seg.at::<FutureRecord>(self.fut_off) };
        if rec.state() == crate::task::FutureState::Running && rec.try_mark_woken() {
            let lane_off = rec.lane();
            Lane::push_from_offset(&self.seg, lane_off, self.fut_off);
            let worker = Lane::from_offset(lane_off).header(&self.seg).assigned_worker();
            self.control.unpark(worker);
        }
    }
}

struct PeriodicEntry {
    fut_off: u64,
    lane_off: u64,
    next_fire: Instant,
}

pub(super) struct Worker {
    id: WorkerId,
    seg: Arc<Segment>,
    fabric: Arc<IpcFabric>,
    pools: Arc<PoolManager>,
    control: Arc<SchedControl>,
    suspended: SuspendedTasks,
    scan: VecDeque<u64>,
    periodic: Vec<PeriodicEntry>,
    batch: u32,
    suspend_init_us: u64,
    suspend_cap_us: u64,
    idle_threshold: u64,
}

impl Worker {
    pub(super) fn new(
        id: WorkerId,
        seg: Arc<Segment>,
        fabric: Arc<IpcFabric>,
        pools: Arc<PoolManager>,
        control: Arc<SchedControl>,
        suspended: SuspendedTasks,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            id,
            seg,
            fabric,
            pools,
            control,
            suspended,
            scan: VecDeque::new(),
            periodic: Vec::new(),
            batch: config.lane_batch,
            suspend_init_us: config.suspend_period_us,
            suspend_cap_us: config.suspend_period_cap_us,
            idle_threshold: config.idle_threshold,
        }
    }

    pub(super) fn run(mut self) {
        let _span = tracing::info_span!("worker", worker = self.id).entered();
        let stats = Arc::clone(self.control.stats(self.id));
        stats.is_running.store(true, std::sync::atomic::Ordering::Release);
        tracing::debug!("worker started");

        while !self.control.stopping() {
            // Absorb lanes delivered since the last pass.
            while let Some(lane_off) = WorkerBoard::drain(&self.seg, self.id) {
                if !self.scan.contains(&lane_off) {
                    self.scan.push_back(lane_off);
                }
            }

            self.fire_periodic(&stats);

            let Some(lane_off) = self.scan.pop_front() else {
                self.idle_tick(&stats);
                continue;
            };

            let lane = Lane::from_offset(lane_off);
            let owner = lane.header(&self.seg).assigned_worker();
            if owner != self.id {
                // The lane was handed to another worker; forward and drop.
                if lane.header(&self.seg).is_enqueued() {
                    WorkerBoard::deliver(&self.seg, owner, lane_off);
                    self.control.unpark(owner);
                }
                continue;
            }

            stats
                .is_active
                .store(true, std::sync::atomic::Ordering::Release);
            let mut processed = 0;
            while processed < self.batch {
                match lane.pop(&self.seg) {
                    Some(handle) => {
                        self.process_handle(handle, lane_off, &stats);
                        processed += 1;
                    }
                    None => break,
                }
            }
            stats
                .is_active
                .store(false, std::sync::atomic::Ordering::Release);

            if processed > 0 {
                stats
                    .idle_iterations
                    .store(0, std::sync::atomic::Ordering::Release);
                stats
                    .suspend_period_us
                    .store(self.suspend_init_us, std::sync::atomic::Ordering::Release);
            }

            if lane.header(&self.seg).task_count() == 0 {
                if lane.finish_drain(&self.seg) {
                    self.scan.push_back(lane_off);
                }
            } else {
                self.scan.push_back(lane_off);
            }
        }

        stats
            .is_running
            .store(false, std::sync::atomic::Ordering::Release);
        tracing::debug!("worker stopped");
    }

    fn idle_tick(&self, stats: &WorkerStats) {
        use std::sync::atomic::Ordering;
        let idle = stats.idle_iterations.fetch_add(1, Ordering::AcqRel) + 1;
        let mut period = stats.suspend_period_us.load(Ordering::Acquire);
        if idle >= self.idle_threshold && period < self.suspend_cap_us {
            period = (period * 2).min(self.suspend_cap_us);
            stats.suspend_period_us.store(period, Ordering::Release);
        }
        self.control.park(self.id, Duration::from_micros(period));
    }

    fn fire_periodic(&mut self, stats: &WorkerStats) {
        let now = Instant::now();
        let seg = &self.seg;
        let stopping = self.control.stopping();
        self.periodic.retain_mut(|entry| {
            // Safety: the runtime keeps its reference to periodic records.
            let rec = unsafe { seg.at::<FutureRecord>(entry.fut_off) };
            if stopping || rec.state().is_terminal() {
                return false;
            }
            if now >= entry.next_fire && rec.state() == crate::task::FutureState::Pending {
                Lane::push_from_offset(seg, entry.lane_off, entry.fut_off);
                entry.next_fire = now + Duration::from_micros(rec.period_us().max(1));
            }
            true
        });
        stats
            .num_periodic_tasks
            .store(self.periodic.len() as u64, std::sync::atomic::Ordering::Release);
    }

    fn release(&self, off: u64) {
        release_ref(&self.seg, self.fabric.local_archive(), off);
    }

    fn process_handle(&mut self, handle: u64, lane_off: u64, stats: &WorkerStats) {
        // Safety: the runtime reference keeps the record alive until the
        // terminal release below.
        let rec = unsafe { self.seg.at::<FutureRecord>(handle) };
        match rec.state() {
            crate::task::FutureState::Pending => {
                if rec.has_flag(flags::CANCEL_REQUESTED) {
                    if rec.try_cancel_pending() {
                        self.fabric.complete_err(handle, &RuntimeError::Cancelled);
                        self.release(handle);
                    }
                    return;
                }
                if !rec.try_start() {
                    return;
                }
                self.start_task(handle, lane_off, stats);
            }
            crate::task::FutureState::Running => match self.suspended.claim(handle) {
                Some(suspended) => {
                    rec.clear_flag(flags::WOKEN);
                    self.control
                        .stats(suspended.parked_by)
                        .num_blocked_tasks
                        .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                    if rec.has_flag(flags::CANCEL_REQUESTED) {
                        // Drop the body so its cleanup runs, then publish.
                        drop(suspended.body);
                        self.fabric.complete_err(handle, &RuntimeError::Cancelled);
                        self.release(handle);
                    } else {
                        self.poll_task(handle, lane_off, suspended.body, stats);
                    }
                }
                None => {
                    if rec.has_flag(flags::WOKEN) {
                        // Woken before its park landed; retry on a later
                        // visit.
                        Lane::push_from_offset(&self.seg, lane_off, handle);
                    }
                }
            },
            _ => {} // terminal duplicate nudge
        }
    }

    fn start_task(&mut self, handle: u64, lane_off: u64, stats: &WorkerStats) {
        // Safety: as in `process_handle`.
        let rec = unsafe { self.seg.at::<FutureRecord>(handle) };
        let (pool, container_id, method) = (rec.pool(), rec.container_id(), rec.method());

        let container = match self.pools.container(pool, container_id) {
            Ok(container) => container,
            Err(err) => {
                self.fabric.complete_err(handle, &err);
                self.release(handle);
                return;
            }
        };

        let input = if rec.has_flag(flags::LOCAL_PAYLOAD) {
            match self.fabric.local_archive().take_input(handle) {
                Some(input) => input,
                None => {
                    let err = RuntimeError::Serde("local task payload missing".into());
                    self.fabric.complete_err(handle, &err);
                    self.release(handle);
                    return;
                }
            }
        } else {
            let (off, len) = rec.input();
            let bytes = if off == 0 {
                Vec::new()
            } else {
                self.seg.read_bytes(off, len as usize)
            };
            match container.module.load_task(method, &bytes) {
                Ok(input) => input,
                Err(err) => {
                    self.fabric.complete_err(handle, &err);
                    self.release(handle);
                    return;
                }
            }
        };

        // A periodic task consumes a fresh copy per firing; the original
        // stays parked for the next one.
        if rec.has_flag(flags::PERIODIC) {
            match container.module.new_copy(method, &input) {
                Ok(copy) => {
                    self.fabric.local_archive().put_input(handle, copy);
                    rec.set_flag(flags::LOCAL_PAYLOAD);
                }
                Err(err) => {
                    tracing::warn!(task_id = rec.task_id(), %err, "periodic re-arm copy failed");
                }
            }
        }

        let ctx = RunContext {
            worker_id: self.id,
            pool,
            container_id,
            task_id: rec.task_id(),
            cancel: CancelToken::new(Arc::clone(&self.seg), handle),
        };

        let module = Arc::clone(&container.module);
        let body = catch_unwind(AssertUnwindSafe(|| module.run(method, input, ctx)));
        match body {
            Err(_) => {
                let err = RuntimeError::Fatal(format!(
                    "module {} panicked building method {}",
                    module.name(),
                    method
                ));
                tracing::error!(task_id = rec.task_id(), %err, "task body construction panicked");
                self.fabric.complete_err(handle, &err);
                self.release(handle);
            }
            Ok(Err(err)) => {
                self.fabric.complete_err(handle, &err);
                self.release(handle);
            }
            Ok(Ok(body)) => self.poll_task(handle, lane_off, body, stats),
        }
    }

    fn poll_task(&mut self, handle: u64, lane_off: u64, mut body: TaskBody, stats: &WorkerStats) {
        let waker = Waker::from(Arc::new(TaskWaker {
            seg: Arc::clone(&self.seg),
            control: Arc::clone(&self.control),
            fut_off: handle,
        }));
        let mut cx = Context::from_waker(&waker);

        let poll = catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        // Safety: as in `process_handle`.
        let rec = unsafe { self.seg.at::<FutureRecord>(handle) };
        match poll {
            Err(_) => {
                // Workers never die; the panic terminates only the task.
                let err = RuntimeError::Fatal("task panicked".into());
                tracing::error!(task_id = rec.task_id(), "panic escaped module run");
                self.fabric.complete_err(handle, &err);
                self.release(handle);
            }
            Ok(Poll::Ready(Ok(out))) => self.finish_ok(handle, lane_off, out),
            Ok(Poll::Ready(Err(err))) => {
                if let RuntimeError::Fatal(reason) = &err {
                    tracing::error!(
                        task_id = rec.task_id(),
                        %reason,
                        "fatal task; destroying container"
                    );
                    let _ = self.pools.remove_container(rec.pool(), rec.container_id());
                }
                self.fabric.complete_err(handle, &err);
                self.release(handle);
            }
            Ok(Poll::Pending) => {
                self.suspended.park(handle, body, self.id);
                stats
                    .num_blocked_tasks
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                // Close the lost-wake window: a waker (or cancel) that fired
                // mid-poll could not claim the body yet.
                if rec.flags() & (flags::WOKEN | flags::CANCEL_REQUESTED) != 0 {
                    Lane::push_from_offset(&self.seg, lane_off, handle);
                }
            }
        }
    }

    fn finish_ok(&mut self, handle: u64, lane_off: u64, out: AnyOut) {
        // Safety: as in `process_handle`.
        let rec = unsafe { self.seg.at::<FutureRecord>(handle) };
        if rec.has_flag(flags::PERIODIC) && !self.control.stopping() {
            rec.rearm();
            let next_fire =
                Instant::now() + Duration::from_micros(rec.period_us().max(1));
            match self
                .periodic
                .iter_mut()
                .find(|entry| entry.fut_off == handle)
            {
                Some(entry) => entry.next_fire = next_fire,
                None => self.periodic.push(PeriodicEntry {
                    fut_off: handle,
                    lane_off,
                    next_fire,
                }),
            }
            return;
        }

        let published = if rec.has_flag(flags::LOCAL_PAYLOAD) {
            self.fabric.complete_ok(handle, OutputPayload::Local(out))
        } else {
            match self
                .pools
                .container(rec.pool(), rec.container_id())
                .and_then(|c| c.module.local_save_out(rec.method(), out.as_ref()))
            {
                Ok(bytes) => self.fabric.complete_ok(handle, OutputPayload::Wire(bytes)),
                Err(err) => {
                    self.fabric.complete_err(handle, &err);
                    self.release(handle);
                    return;
                }
            }
        };
        if let Err(err) = published {
            self.fabric.complete_err(handle, &err);
        }
        self.release(handle);
    }
}
