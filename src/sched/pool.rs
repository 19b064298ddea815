//! Worker pool lifecycle and monitor surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::ipc::IpcFabric;
use crate::mem::Segment;
use crate::module::PoolManager;
use crate::task::WorkerId;

use super::worker::{SuspendedTasks, Worker};

/// Live per-worker counters backing `SystemMonitor`.
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub is_running: AtomicBool,
    pub is_active: AtomicBool,
    pub idle_iterations: AtomicU64,
    pub num_blocked_tasks: AtomicU64,
    pub num_periodic_tasks: AtomicU64,
    pub suspend_period_us: AtomicU64,
}

impl WorkerStats {
    fn new(worker_id: WorkerId, suspend_period_us: u64) -> Self {
        Self {
            worker_id,
            is_running: AtomicBool::new(false),
            is_active: AtomicBool::new(false),
            idle_iterations: AtomicU64::new(0),
            num_blocked_tasks: AtomicU64::new(0),
            num_periodic_tasks: AtomicU64::new(0),
            suspend_period_us: AtomicU64::new(suspend_period_us),
        }
    }
}

/// One worker's row in the `SystemMonitor` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: u32,
    pub is_running: bool,
    pub is_active: bool,
    pub idle_iterations: u64,
    pub num_queued_tasks: u64,
    pub num_blocked_tasks: u64,
    pub num_periodic_tasks: u64,
    pub suspend_period_us: u64,
}

struct Parker {
    lock: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn park(&self, timeout: Duration) {
        let mut nudged = self.lock.lock().unwrap();
        if !*nudged {
            let (guard, _) = self.cv.wait_timeout(nudged, timeout).unwrap();
            nudged = guard;
        }
        *nudged = false;
    }

    fn unpark(&self) {
        *self.lock.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

/// Shared scheduler state: stats, stop/drain flags, worker parkers.
pub struct SchedControl {
    stats: Vec<Arc<WorkerStats>>,
    parkers: Vec<Parker>,
    stop: AtomicBool,
    draining: AtomicBool,
}

impl SchedControl {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let stats = (0..config.num_workers as u32)
            .map(|id| Arc::new(WorkerStats::new(id, config.suspend_period_us)))
            .collect();
        let parkers = (0..config.num_workers).map(|_| Parker::new()).collect();
        Arc::new(Self {
            stats,
            parkers,
            stop: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.stats.len()
    }

    pub fn stats(&self, worker: WorkerId) -> &Arc<WorkerStats> {
        &self.stats[worker as usize]
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.unpark_all();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// `AnnounceShutdown`: refuse new ingress while outstanding work drains.
    pub fn announce_shutdown(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn unpark(&self, worker: WorkerId) {
        if let Some(parker) = self.parkers.get(worker as usize) {
            parker.unpark();
        }
    }

    pub fn unpark_all(&self) {
        for parker in &self.parkers {
            parker.unpark();
        }
    }

    pub(super) fn park(&self, worker: WorkerId, timeout: Duration) {
        self.parkers[worker as usize].park(timeout);
    }

    /// Assemble the `SystemMonitor` rows; `queued` comes from the lane
    /// registry since producers live in other processes.
    pub fn snapshot(&self, queued: &HashMap<WorkerId, u64>) -> Vec<WorkerInfo> {
        self.stats
            .iter()
            .map(|stats| WorkerInfo {
                worker_id: stats.worker_id,
                is_running: stats.is_running.load(Ordering::Acquire),
                is_active: stats.is_active.load(Ordering::Acquire),
                idle_iterations: stats.idle_iterations.load(Ordering::Acquire),
                num_queued_tasks: queued.get(&stats.worker_id).copied().unwrap_or(0),
                num_blocked_tasks: stats.num_blocked_tasks.load(Ordering::Acquire),
                num_periodic_tasks: stats.num_periodic_tasks.load(Ordering::Acquire),
                suspend_period_us: stats.suspend_period_us.load(Ordering::Acquire),
            })
            .collect()
    }
}

/// Owns the worker threads.
pub struct WorkerPool {
    control: Arc<SchedControl>,
    suspended: SuspendedTasks,
    fabric: Arc<IpcFabric>,
    joins: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the configured worker threads.
    pub fn start(
        seg: Arc<Segment>,
        fabric: Arc<IpcFabric>,
        pools: Arc<PoolManager>,
        control: Arc<SchedControl>,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        let suspended = SuspendedTasks::default();
        let mut joins = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers as u32 {
            let worker = Worker::new(
                id,
                Arc::clone(&seg),
                Arc::clone(&fabric),
                Arc::clone(&pools),
                Arc::clone(&control),
                suspended.clone(),
                config,
            );
            joins.push(
                std::thread::Builder::new()
                    .name(format!("ctx-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("spawn worker thread"),
            );
        }
        Arc::new(Self {
            control,
            suspended,
            fabric,
            joins: Mutex::new(joins),
        })
    }

    pub fn control(&self) -> &Arc<SchedControl> {
        &self.control
    }

    /// Stop all workers and fail whatever was still parked.
    pub fn stop_and_join(&self) {
        self.control.request_stop();
        let joins: Vec<_> = self.joins.lock().unwrap().drain(..).collect();
        for join in joins {
            let _ = join.join();
        }
        for off in self.suspended.drain_offsets() {
            self.fabric.complete_err(off, &RuntimeError::RuntimeShutdown);
            crate::task::release_ref(
                self.fabric.segment(),
                self.fabric.local_archive(),
                off,
            );
        }
    }
}
