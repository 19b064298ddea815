//! Task submission over the shared segment.
//!
//! `submit` allocates a future record, stages the payload (zero-copy local
//! archive for same-process callers, bincode bytes in a segment payload
//! block otherwise), and pushes the record offset into the target lane with
//! a bounded, jittered retry before surfacing queue-full.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, RuntimeError};
use crate::mem::Segment;
use crate::task::{
    flags, CompletionBoard, ContainerId, FutureInit, FutureRecord, LocalArchive, MethodId, PoolId,
    TaskFuture,
};

use super::{Lane, WorkerBoard};

/// Task payload at submission time.
pub enum Payload {
    /// Typed task struct, parked in the local archive (same process).
    Local(Box<dyn Any + Send + Sync>),
    /// Pre-serialized task bytes (cross-process or remote route).
    Wire(Vec<u8>),
}

/// Everything needed to submit one task into a lane.
pub struct SubmitSpec {
    pub pool: PoolId,
    pub container_id: ContainerId,
    pub method: MethodId,
    pub payload: Payload,
    /// Non-zero re-arms the task on this period after each completion.
    pub periodic_us: u64,
}

/// Process handle to the IPC fabric.
pub struct IpcFabric {
    seg: Arc<Segment>,
    board: Arc<CompletionBoard>,
    local: Arc<LocalArchive>,
    send_retries: u32,
}

impl IpcFabric {
    pub fn new(
        seg: Arc<Segment>,
        board: Arc<CompletionBoard>,
        local: Arc<LocalArchive>,
        send_retries: u32,
    ) -> Self {
        Self {
            seg,
            board,
            local,
            send_retries,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    pub fn board(&self) -> &Arc<CompletionBoard> {
        &self.board
    }

    pub fn local_archive(&self) -> &Arc<LocalArchive> {
        &self.local
    }

    /// Submit a task into `lane` and return the awaitable future handle.
    pub fn submit(&self, lane: Lane, spec: SubmitSpec) -> Result<TaskFuture> {
        if self.seg.is_shutdown() {
            return Err(RuntimeError::RuntimeShutdown);
        }
        let off = self.seg.alloc_future()?;

        let mut record_flags = 0;
        if matches!(spec.payload, Payload::Local(_)) {
            record_flags |= flags::LOCAL_PAYLOAD;
        }
        if spec.periodic_us > 0 {
            record_flags |= flags::PERIODIC;
        }

        let rec_ref = FutureRecord::init_at(
            &self.seg,
            off,
            FutureInit {
                task_id: self.seg.next_task_id(),
                pool: spec.pool,
                container_id: spec.container_id,
                method: spec.method,
                flags: record_flags,
                period_us: spec.periodic_us,
            },
        );
        let rec = rec_ref.resolve(&self.seg);
        rec.set_lane(lane.offset());

        match spec.payload {
            Payload::Local(input) => {
                self.local.put_input(off, input);
            }
            Payload::Wire(bytes) => {
                if !bytes.is_empty() {
                    let payload_off = match self.seg.alloc_payload(bytes.len() as u64) {
                        Ok(payload_off) => payload_off,
                        Err(err) => {
                            self.seg.free_future(off);
                            return Err(err);
                        }
                    };
                    self.seg.write_bytes(payload_off, &bytes);
                    rec.set_input(payload_off, bytes.len() as u32);
                }
            }
        }

        // Bounded enqueue: a full ring is backpressure, not a spin target.
        let mut rng = rand::thread_rng();
        let mut attempt = 0;
        loop {
            match lane.push(&self.seg, off) {
                Ok(deliver) => {
                    if deliver {
                        WorkerBoard::deliver(
                            &self.seg,
                            lane.header(&self.seg).assigned_worker(),
                            lane.offset(),
                        );
                    }
                    tracing::trace!(
                        task_id = rec.task_id(),
                        pool = %spec.pool,
                        method = spec.method,
                        "task submitted"
                    );
                    return Ok(TaskFuture::new(
                        Arc::clone(&self.seg),
                        Arc::clone(&self.board),
                        Arc::clone(&self.local),
                        off,
                    ));
                }
                Err(RuntimeError::QueueFull) if attempt < self.send_retries => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_micros(rng.gen_range(10..100)));
                }
                Err(err) => {
                    // Reclaim the staged record before surfacing.
                    let (input_off, input_len) = rec.input();
                    if input_off != 0 {
                        self.seg.free_payload(input_off, input_len as u64);
                    }
                    self.local.remove(off);
                    self.seg.free_future(off);
                    return Err(err);
                }
            }
        }
    }

    /// Publish a task's successful result and wake same-process waiters.
    pub fn complete_ok(&self, off: u64, output: OutputPayload) -> Result<()> {
        // Safety: the runtime holds a counted reference while completing.
        let rec = unsafe { self.seg.at::<FutureRecord>(off) };
        match output {
            OutputPayload::Local(any) => {
                self.local.put_output(off, any);
            }
            OutputPayload::Wire(bytes) => {
                if !bytes.is_empty() {
                    let payload_off = self.seg.alloc_payload(bytes.len() as u64)?;
                    self.seg.write_bytes(payload_off, &bytes);
                    rec.set_output(payload_off, bytes.len() as u32);
                }
            }
        }
        rec.finish(
            crate::task::FutureState::Ready,
            crate::error::ErrorCode::Ok,
        );
        self.board.notify(off);
        Ok(())
    }

    /// Publish a task failure and wake same-process waiters.
    pub fn complete_err(&self, off: u64, err: &RuntimeError) {
        // Safety: as above.
        let rec = unsafe { self.seg.at::<FutureRecord>(off) };
        let (state, code) = match err {
            RuntimeError::Cancelled => (
                crate::task::FutureState::Cancelled,
                crate::error::ErrorCode::Cancelled,
            ),
            other => (crate::task::FutureState::Error, other.code()),
        };
        rec.finish(state, code);
        self.board.notify(off);
    }
}

/// Result payload counterpart of [`Payload`].
pub enum OutputPayload {
    Local(Box<dyn Any + Send + Sync>),
    Wire(Vec<u8>),
}
