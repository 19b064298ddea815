//! Built-in admin module on pool `(0, 0)`.
//!
//! Owns pool lifecycle, migration, monitoring, and shutdown. Its control
//! lane is the well-known lane every client discovers from the segment
//! header at init.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::module::{AnyOut, AnyTask, Module, ModuleEnv, RunContext, TaskBody};
use crate::sched::WorkerInfo;
use crate::task::{MethodId, PoolId, PoolQuery};

pub const MODULE_NAME: &str = "admin";
/// Default heartbeat period for the runtime's periodic liveness task.
pub const HEARTBEAT_PERIOD_US: u64 = 500_000;

pub mod methods {
    //! Method-id table for the admin module (ids per the original table).
    use super::*;

    crate::method_table! {
        module "admin";
        0  => CREATE "Create" (CreateParams => CreateResult),
        1  => DESTROY "Destroy" (DestroyTask => DestroyResult),
        9  => MONITOR "Monitor" (MonitorTask => SystemMonitorResult),
        10 => GET_OR_CREATE_POOL "GetOrCreatePool" (GetOrCreatePoolTask => GetOrCreatePoolResult),
        11 => DESTROY_POOL "DestroyPool" (DestroyPoolTask => DestroyPoolResult),
        12 => STOP_RUNTIME "StopRuntime" (StopRuntimeTask => StopRuntimeResult),
        18 => SUBMIT_BATCH "SubmitBatch" (SubmitBatchTask => SubmitBatchResult),
        22 => REGISTER_MEMORY "RegisterMemory" (RegisterMemoryTask => RegisterMemoryResult),
        26 => MIGRATE_CONTAINERS "MigrateContainers" (MigrateContainersTask => MigrateContainersResult),
        27 => HEARTBEAT "Heartbeat" (HeartbeatTask => HeartbeatResult),
        28 => HEARTBEAT_PROBE "HeartbeatProbe" (HeartbeatProbeTask => HeartbeatProbeResult),
        31 => SYSTEM_MONITOR "SystemMonitor" (SystemMonitorTask => SystemMonitorResult),
        32 => ANNOUNCE_SHUTDOWN "AnnounceShutdown" (AnnounceShutdownTask => AnnounceShutdownResult),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrCreatePoolTask {
    pub name: String,
    pub id: PoolId,
    pub module: String,
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrCreatePoolResult {
    pub id: PoolId,
    pub containers: Vec<u32>,
    /// Per-container ingress-lane offsets, for out-of-process submitters.
    pub lanes: Vec<(u32, Vec<u64>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyPoolTask {
    pub id: PoolId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyPoolResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRuntimeTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRuntimeResult {}

/// One pre-serialized task in a `SubmitBatch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub pool: PoolId,
    pub container_id: u32,
    pub method: MethodId,
    pub query: PoolQuery,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchTask {
    pub entries: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchResult {
    pub num_submitted: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMemoryTask {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMemoryResult {
    pub region_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateInfo {
    pub pool: PoolId,
    pub container_id: u32,
    pub dest_node: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateContainersTask {
    pub migrations: Vec<MigrateInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateContainersResult {
    pub num_migrated: u32,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatTask {
    pub node: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatProbeTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatProbeResult {
    /// `(node_id, microseconds since last beat)` per known node.
    pub nodes: Vec<(u32, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMonitorTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMonitorResult {
    pub workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceShutdownTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceShutdownResult {}

struct RegisteredRegion {
    name: String,
    size: u64,
}

struct AdminInner {
    env: ModuleEnv,
    regions: Mutex<Vec<RegisteredRegion>>,
}

/// The admin container instance.
pub struct AdminModule {
    inner: Arc<AdminInner>,
}

impl AdminModule {
    pub fn factory(env: &ModuleEnv) -> Arc<dyn Module> {
        Arc::new(Self {
            inner: Arc::new(AdminInner {
                env: env.clone(),
                regions: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl AdminInner {
    fn system_monitor(&self) -> SystemMonitorResult {
        let queued = self.env.pools.queued_by_worker();
        SystemMonitorResult {
            workers: self.env.sched.snapshot(&queued),
        }
    }

    async fn get_or_create_pool(self: Arc<Self>, task: GetOrCreatePoolTask) -> Result<AnyOut> {
        let pool = self.env.pools.get_or_create(
            &self.env,
            &task.name,
            task.id,
            &task.module,
            &task.params,
        )?;
        let containers = pool.container_ids();
        let lanes = containers
            .iter()
            .filter_map(|id| pool.container(*id))
            .map(|c| (c.id, c.lanes.iter().map(|l| l.offset()).collect()))
            .collect();
        Ok(Box::new(GetOrCreatePoolResult {
            id: pool.id,
            containers,
            lanes,
        }))
    }

    async fn destroy_pool(self: Arc<Self>, task: DestroyPoolTask) -> Result<AnyOut> {
        if task.id == PoolId::ADMIN {
            return Err(RuntimeError::PoolNotFound(
                "the admin pool cannot be destroyed".into(),
            ));
        }
        // Remove from dispatch first so no new tasks land, then wait for
        // the lanes to drain before dropping the containers.
        let pool = self.env.pools.remove_pool(task.id)?;
        let seg = self.env.fabric.segment();
        loop {
            let outstanding: u64 = pool
                .container_ids()
                .iter()
                .filter_map(|id| pool.container(*id))
                .map(|c| c.queued_tasks(seg))
                .sum();
            if outstanding == 0 {
                break;
            }
            crate::sched::yield_now().await;
        }
        Ok(Box::new(DestroyPoolResult {}))
    }

    async fn submit_batch(self: Arc<Self>, task: SubmitBatchTask) -> Result<AnyOut> {
        let mut num_submitted = 0;
        for entry in task.entries {
            self.env.pools.route(entry.query)?;
            let container = self.env.pools.container(entry.pool, entry.container_id)?;
            let lane = container.select_lane(None);
            // Handles are dropped immediately; the records complete and
            // reclaim through the runtime reference.
            let _ = self.env.fabric.submit(
                lane,
                crate::ipc::SubmitSpec {
                    pool: entry.pool,
                    container_id: entry.container_id,
                    method: entry.method,
                    payload: crate::ipc::Payload::Wire(entry.payload),
                    periodic_us: 0,
                },
            )?;
            self.env
                .sched
                .unpark(lane.header(self.env.fabric.segment()).assigned_worker());
            num_submitted += 1;
        }
        Ok(Box::new(SubmitBatchResult { num_submitted }))
    }

    async fn migrate_containers(self: Arc<Self>, task: MigrateContainersTask) -> Result<AnyOut> {
        let mut num_migrated = 0;
        let mut diagnostic = None;
        for migration in &task.migrations {
            match self.env.pools.migrate(
                migration.pool,
                migration.container_id,
                migration.dest_node,
            ) {
                Ok(()) => num_migrated += 1,
                Err(err) => {
                    diagnostic = Some(format!(
                        "migration of {}/{} failed: {err}",
                        migration.pool, migration.container_id
                    ));
                }
            }
        }
        Ok(Box::new(MigrateContainersResult {
            num_migrated,
            diagnostic,
        }))
    }
}

impl Module for AdminModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn method_name(&self, method: MethodId) -> Option<&'static str> {
        methods::method_name(method)
    }

    fn run(&self, method: MethodId, task: AnyTask, _ctx: RunContext) -> Result<TaskBody> {
        let inner = Arc::clone(&self.inner);
        match method {
            methods::CREATE => Ok(Box::pin(async move {
                Ok(Box::new(CreateResult {}) as AnyOut)
            })),
            methods::DESTROY => Ok(Box::pin(async move {
                Ok(Box::new(DestroyResult {}) as AnyOut)
            })),
            methods::MONITOR | methods::SYSTEM_MONITOR => {
                let report = inner.system_monitor();
                Ok(Box::pin(async move { Ok(Box::new(report) as AnyOut) }))
            }
            methods::GET_OR_CREATE_POOL => {
                let task = downcast::<GetOrCreatePoolTask>(task)?;
                Ok(Box::pin(async move {
                    inner.get_or_create_pool(*task).await
                }))
            }
            methods::DESTROY_POOL => {
                let task = downcast::<DestroyPoolTask>(task)?;
                Ok(Box::pin(async move { inner.destroy_pool(*task).await }))
            }
            methods::STOP_RUNTIME => Ok(Box::pin(async move {
                tracing::info!("runtime stop requested");
                inner.env.sched.announce_shutdown();
                inner.env.sched.request_stop();
                Ok(Box::new(StopRuntimeResult {}) as AnyOut)
            })),
            methods::SUBMIT_BATCH => {
                let task = downcast::<SubmitBatchTask>(task)?;
                Ok(Box::pin(async move { inner.submit_batch(*task).await }))
            }
            methods::REGISTER_MEMORY => {
                let task = downcast::<RegisterMemoryTask>(task)?;
                Ok(Box::pin(async move {
                    let region = RegisteredRegion {
                        name: task.name,
                        size: task.size,
                    };
                    let mut regions = inner.regions.lock().unwrap();
                    tracing::debug!(name = %region.name, size = region.size, "memory registered");
                    regions.push(region);
                    let region_id = regions.len() as u32 - 1;
                    Ok(Box::new(RegisterMemoryResult { region_id }) as AnyOut)
                }))
            }
            methods::MIGRATE_CONTAINERS => {
                let task = downcast::<MigrateContainersTask>(task)?;
                Ok(Box::pin(async move {
                    inner.migrate_containers(*task).await
                }))
            }
            methods::HEARTBEAT => {
                let task = downcast::<HeartbeatTask>(task)?;
                Ok(Box::pin(async move {
                    inner.env.pools.heartbeat(task.node);
                    Ok(Box::new(HeartbeatResult {}) as AnyOut)
                }))
            }
            methods::HEARTBEAT_PROBE => Ok(Box::pin(async move {
                Ok(Box::new(HeartbeatProbeResult {
                    nodes: inner.env.pools.probe(),
                }) as AnyOut)
            })),
            methods::ANNOUNCE_SHUTDOWN => Ok(Box::pin(async move {
                inner.env.sched.announce_shutdown();
                Ok(Box::new(AnnounceShutdownResult {}) as AnyOut)
            })),
            other => Err(RuntimeError::MethodNotFound {
                module: MODULE_NAME.to_string(),
                method: other,
            }),
        }
    }

    fn save_task(&self, method: MethodId, task: &AnyTask) -> Result<Vec<u8>> {
        methods::save_task(method, task)
    }

    fn load_task(&self, method: MethodId, bytes: &[u8]) -> Result<AnyTask> {
        methods::load_task(method, bytes)
    }

    fn local_save_out(&self, method: MethodId, out: &dyn std::any::Any) -> Result<Vec<u8>> {
        methods::save_out(method, out)
    }

    fn local_load_in(&self, method: MethodId, bytes: &[u8]) -> Result<AnyOut> {
        methods::load_out(method, bytes)
    }

    fn new_copy(&self, method: MethodId, task: &AnyTask) -> Result<AnyTask> {
        methods::new_copy(method, task)
    }

    fn aggregate(&self, method: MethodId, origin: AnyOut, replica: AnyOut) -> Result<AnyOut> {
        // SubmitBatch replicas merge by summing submission counts; replicas
        // are delivered at most once, so the sum stays stable.
        if method == methods::SUBMIT_BATCH {
            return merge_submit_batch(origin, replica);
        }
        Ok(origin)
    }
}

fn merge_submit_batch(origin: AnyOut, replica: AnyOut) -> Result<AnyOut> {
    let origin = origin
        .downcast::<SubmitBatchResult>()
        .map_err(|_| RuntimeError::Serde("aggregate payload mismatch".into()))?;
    let replica = replica
        .downcast::<SubmitBatchResult>()
        .map_err(|_| RuntimeError::Serde("aggregate payload mismatch".into()))?;
    Ok(Box::new(SubmitBatchResult {
        num_submitted: origin.num_submitted + replica.num_submitted,
    }))
}

fn downcast<T: 'static>(task: AnyTask) -> Result<Box<T>> {
    task.downcast::<T>()
        .map_err(|_| RuntimeError::Serde("admin task payload mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_matches_ids() {
        assert_eq!(methods::GET_OR_CREATE_POOL, 10);
        assert_eq!(methods::MIGRATE_CONTAINERS, 26);
        assert_eq!(methods::SYSTEM_MONITOR, 31);
        assert_eq!(
            methods::method_name(methods::ANNOUNCE_SHUTDOWN),
            Some("AnnounceShutdown")
        );
        assert_eq!(methods::method_name(2), None);
    }

    #[test]
    fn submit_batch_results_merge_by_sum() {
        // Replica merges must be order-independent so aggregation stays
        // idempotent under at-most-once delivery.
        let to_out = |n| Box::new(SubmitBatchResult { num_submitted: n }) as AnyOut;
        let merge = |a: AnyOut, b: AnyOut| -> u32 {
            let merged = merge_submit_batch(a, b).unwrap();
            merged
                .downcast::<SubmitBatchResult>()
                .unwrap()
                .num_submitted
        };
        assert_eq!(merge(to_out(3), to_out(4)), 7);
        assert_eq!(merge(to_out(4), to_out(3)), 7);
    }
}
