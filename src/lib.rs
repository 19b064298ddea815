//! Context Runtime: a distributed I/O acceleration runtime.
//!
//! The runtime hosts *containers* (named service instances) that execute
//! typed *tasks* for local and remote clients. Three subsystems carry the
//! weight:
//!
//! - a shared-memory IPC fabric: lock-free per-lane queues of future
//!   handles in a named segment any process can map;
//! - a cooperative worker scheduler with task-suspending synchronization
//!   primitives (`CoMutex`, `CoRwLock`, `CoFuture`);
//! - the Context Transfer Engine (CTE): tag/blob storage chunked and
//!   placed over registered block devices, fed by the Context Assimilation
//!   Engine (CAE) ingest pipeline.
//!
//! Processes join via [`runtime_init`]: a `Server` owns the segment and
//! workers; `Client`s attach and submit through shared memory.

pub mod admin;
pub mod aio;
pub mod bdev;
pub mod cae;
pub mod client;
pub mod config;
pub mod cte;
pub mod error;
pub mod ipc;
pub mod mem;
pub mod module;
pub mod runtime;
pub mod sched;
pub mod task;

pub use client::{AdminClient, CaeClient, ContextInterface, CteClient};
pub use config::RuntimeConfig;
pub use error::{ErrorCode, Result, RuntimeError};
pub use runtime::{runtime, runtime_init, runtime_shutdown, ContextClient, Runtime, RuntimeMode};
pub use task::{PoolId, PoolQuery, TaskFuture};
