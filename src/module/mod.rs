//! Modules: method tables plus task definitions, instantiated as containers.
//!
//! A module exposes, by method id, the operations the scheduler needs:
//! `run` builds the task's cooperative body, `save_task`/`load_task` move
//! task inputs across the wire, `local_save_out`/`local_load_in` move result
//! payloads, and `new_copy`/`aggregate` support replicated methods. Ids 0..9
//! are reserved (`Create`, `Destroy`, `Monitor`); module-specific methods
//! start at 10.

mod registry;

pub use registry::{Container, ModuleEnv, ModuleFactory, ModuleRegistry, Pool, PoolManager};

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::mem::Segment;
use crate::task::{ContainerId, FutureRecord, MethodId, PoolId, TaskId, WorkerId};

/// Typed task struct, boxed for dispatch.
pub type AnyTask = Box<dyn Any + Send + Sync>;
/// Typed result struct, boxed for dispatch.
pub type AnyOut = Box<dyn Any + Send + Sync>;
/// The cooperative body of a running task.
pub type TaskBody = BoxFuture<'static, Result<AnyOut>>;

/// Submission helper for module code issuing sub-tasks through the fabric.
///
/// All payloads stay in the local archive (same process); routing hints are
/// still resolved against the address table so `Specific` to an unknown
/// node fails `unreachable`.
#[derive(Clone)]
pub struct ModuleClient {
    fabric: Arc<crate::ipc::IpcFabric>,
    pools: Arc<PoolManager>,
    sched: Arc<crate::sched::SchedControl>,
}

impl ModuleClient {
    pub fn new(
        fabric: Arc<crate::ipc::IpcFabric>,
        pools: Arc<PoolManager>,
        sched: Arc<crate::sched::SchedControl>,
    ) -> Self {
        Self {
            fabric,
            pools,
            sched,
        }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn fabric(&self) -> &Arc<crate::ipc::IpcFabric> {
        &self.fabric
    }

    /// Submit a typed task and return its future handle.
    pub fn submit<T: Send + Sync + 'static>(
        &self,
        pool: PoolId,
        container_id: ContainerId,
        method: MethodId,
        query: crate::task::PoolQuery,
        task: T,
    ) -> Result<crate::task::TaskFuture> {
        // Single-runtime cluster: every reachable node executes here.
        self.pools.route(query)?;
        let container = self.pools.container(pool, container_id)?;
        let lane = container.select_lane(None);
        let future = self.fabric.submit(
            lane,
            crate::ipc::SubmitSpec {
                pool,
                container_id,
                method,
                payload: crate::ipc::Payload::Local(Box::new(task)),
                periodic_us: 0,
            },
        )?;
        self.sched
            .unpark(lane.header(self.fabric.segment()).assigned_worker());
        Ok(future)
    }

    /// Submit, await cooperatively, and downcast the typed result.
    pub async fn call<T, Out>(
        &self,
        pool: PoolId,
        container_id: ContainerId,
        method: MethodId,
        task: T,
    ) -> Result<Out>
    where
        T: Send + Sync + 'static,
        Out: 'static,
    {
        let future = self.submit(pool, container_id, method, crate::task::PoolQuery::Local, task)?;
        future.join().await?;
        match future.output()? {
            crate::task::TaskOutput::Local(any) => Ok(*any
                .downcast::<Out>()
                .map_err(|_| crate::error::RuntimeError::Serde("sub-task result type mismatch".into()))?),
            crate::task::TaskOutput::Wire(_) => Err(crate::error::RuntimeError::Serde(
                "sub-task produced a wire payload on the local path".into(),
            )),
        }
    }
}

/// Per-dispatch execution context handed to `Module::run`.
#[derive(Clone)]
pub struct RunContext {
    pub worker_id: WorkerId,
    pub pool: PoolId,
    pub container_id: ContainerId,
    pub task_id: TaskId,
    pub cancel: CancelToken,
}

/// Observes cancellation requests on the task's future record.
///
/// A running task sees the request only at a suspension point; long
/// handlers may also poll it explicitly between pipeline stages.
#[derive(Clone)]
pub struct CancelToken {
    seg: Arc<Segment>,
    off: u64,
}

impl CancelToken {
    pub(crate) fn new(seg: Arc<Segment>, off: u64) -> Self {
        Self { seg, off }
    }

    pub fn is_cancelled(&self) -> bool {
        // Safety: the worker holds a counted reference while the task runs.
        let rec = unsafe { self.seg.at::<FutureRecord>(self.off) };
        rec.has_flag(crate::task::flags::CANCEL_REQUESTED)
    }
}

/// A module's method table, shared by its containers and its clients.
pub trait Module: Send + Sync {
    /// Module name used in dispatch errors and monitor output.
    fn name(&self) -> &'static str;

    /// Human-readable method name per the module's id table.
    fn method_name(&self, method: MethodId) -> Option<&'static str>;

    /// Build the cooperative body for one dispatch.
    fn run(&self, method: MethodId, task: AnyTask, ctx: RunContext) -> Result<TaskBody>;

    /// Serialize a task input for remote execution.
    fn save_task(&self, method: MethodId, task: &AnyTask) -> Result<Vec<u8>>;

    /// Deserialize a task input received from the wire.
    fn load_task(&self, method: MethodId, bytes: &[u8]) -> Result<AnyTask>;

    /// Serialize a result payload for publication.
    fn local_save_out(&self, method: MethodId, out: &dyn Any) -> Result<Vec<u8>>;

    /// Deserialize a published result payload.
    fn local_load_in(&self, method: MethodId, bytes: &[u8]) -> Result<AnyOut>;

    /// Deep-copy a task input for replication to another destination.
    fn new_copy(&self, method: MethodId, task: &AnyTask) -> Result<AnyTask>;

    /// Merge a replica's result into the origin's. Must be idempotent; the
    /// default keeps the origin.
    fn aggregate(&self, _method: MethodId, origin: AnyOut, _replica: AnyOut) -> Result<AnyOut> {
        Ok(origin)
    }

    /// Reclamation hook for task-owned resources. The default drops.
    fn del(&self, _method: MethodId, _task: AnyTask) {}
}

/// Declares a module's method-id table and derives the serialization
/// plumbing every [`Module`] implementation delegates to.
///
/// ```ignore
/// method_table! {
///     module "cte_core";
///     14 => GET_OR_CREATE_TAG "GetOrCreateTag" (GetOrCreateTagTask => GetOrCreateTagResult),
///     15 => PUT_BLOB "PutBlob" (PutBlobTask => PutBlobResult),
/// }
/// ```
///
/// Generates `pub const` method ids plus `method_name`, `save_task`,
/// `load_task`, `save_out`, `load_out`, and `new_copy` free functions in
/// the enclosing module.
#[macro_export]
macro_rules! method_table {
    (
        module $module:literal;
        $( $id:literal => $const_name:ident $method_str:literal ( $task:ty => $out:ty ) ),+ $(,)?
    ) => {
        $( pub const $const_name: $crate::task::MethodId = $id; )+

        pub fn method_name(method: $crate::task::MethodId) -> Option<&'static str> {
            match method {
                $( $id => Some($method_str), )+
                _ => None,
            }
        }

        fn unknown_method(method: $crate::task::MethodId) -> $crate::error::RuntimeError {
            $crate::error::RuntimeError::MethodNotFound {
                module: $module.to_string(),
                method,
            }
        }

        fn payload_mismatch(method: $crate::task::MethodId) -> $crate::error::RuntimeError {
            $crate::error::RuntimeError::Serde(format!(
                "payload type mismatch for {}::{}",
                $module, method
            ))
        }

        pub fn save_task(
            method: $crate::task::MethodId,
            task: &$crate::module::AnyTask,
        ) -> $crate::error::Result<Vec<u8>> {
            match method {
                $( $id => {
                    let task = task
                        .downcast_ref::<$task>()
                        .ok_or_else(|| payload_mismatch(method))?;
                    $crate::task::to_wire(task)
                } )+
                _ => Err(unknown_method(method)),
            }
        }

        pub fn load_task(
            method: $crate::task::MethodId,
            bytes: &[u8],
        ) -> $crate::error::Result<$crate::module::AnyTask> {
            match method {
                $( $id => Ok(Box::new($crate::task::from_wire::<$task>(bytes)?)), )+
                _ => Err(unknown_method(method)),
            }
        }

        pub fn save_out(
            method: $crate::task::MethodId,
            out: &dyn std::any::Any,
        ) -> $crate::error::Result<Vec<u8>> {
            match method {
                $( $id => {
                    let out = out
                        .downcast_ref::<$out>()
                        .ok_or_else(|| payload_mismatch(method))?;
                    $crate::task::to_wire(out)
                } )+
                _ => Err(unknown_method(method)),
            }
        }

        pub fn load_out(
            method: $crate::task::MethodId,
            bytes: &[u8],
        ) -> $crate::error::Result<$crate::module::AnyOut> {
            match method {
                $( $id => Ok(Box::new($crate::task::from_wire::<$out>(bytes)?)), )+
                _ => Err(unknown_method(method)),
            }
        }

        pub fn new_copy(
            method: $crate::task::MethodId,
            task: &$crate::module::AnyTask,
        ) -> $crate::error::Result<$crate::module::AnyTask> {
            let bytes = save_task(method, task)?;
            load_task(method, &bytes)
        }
    };
}
