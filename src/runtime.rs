//! Runtime lifecycle: server bring-up, client attachment, and the
//! process-wide context object.
//!
//! `runtime_init(mode)` builds the process context: `Server` creates the
//! segment and workers; `Client` attaches to an existing segment, or hosts
//! an integrated server when `CHIMAERA_WITH_RUNTIME=1` / `INIT_CHIMAERA=1`
//! is set. `runtime_shutdown()` tears the context down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::admin::{self, AdminModule};
use crate::aio::IoFactory;
use crate::bdev::BdevModule;
use crate::cae::CaeModule;
use crate::config::RuntimeConfig;
use crate::cte::CteModule;
use crate::error::{Result, RuntimeError};
use crate::ipc::{IpcFabric, Lane, Payload, SubmitSpec};
use crate::mem::Segment;
use crate::module::{ModuleEnv, ModuleRegistry, PoolManager};
use crate::sched::{SchedControl, WorkerPool};
use crate::task::{
    CompletionBoard, ContainerId, LocalArchive, MethodId, PoolId, PoolQuery, TaskFuture,
    TaskOutput, FUTURE_SLOT_SIZE,
};

/// How this process participates in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Attach to an existing runtime's segment.
    Client,
    /// Host the segment and the worker scheduler.
    Server,
}

/// The server half: segment owner, worker pool, built-in pools.
pub struct Runtime {
    config: RuntimeConfig,
    seg: Arc<Segment>,
    fabric: Arc<IpcFabric>,
    pools: Arc<PoolManager>,
    sched: Arc<SchedControl>,
    workers: Arc<WorkerPool>,
    env: ModuleEnv,
    /// Keeps the periodic heartbeat record referenced for the runtime's
    /// lifetime.
    heartbeat: Mutex<Option<TaskFuture>>,
}

impl Runtime {
    /// Create the segment, spawn workers, and bootstrap the built-in
    /// pools (admin, cte_core, cae_core).
    pub fn start(config: RuntimeConfig) -> Result<Arc<Self>> {
        let seg = Arc::new(Segment::create(
            &config.segment_path(),
            config.segment_size,
            config.future_slots,
            FUTURE_SLOT_SIZE,
        )?);
        let board = Arc::new(CompletionBoard::new());
        let local = Arc::new(LocalArchive::new());
        let fabric = Arc::new(IpcFabric::new(
            Arc::clone(&seg),
            board,
            local,
            config.send_retries,
        ));

        let modules = Arc::new(ModuleRegistry::new());
        modules.register(
            admin::MODULE_NAME,
            Arc::new(|env: &ModuleEnv, _pool, _name, _params: &[u8]| {
                Ok(AdminModule::factory(env))
            }),
        );
        modules.register(
            crate::bdev::MODULE_NAME,
            Arc::new(|env: &ModuleEnv, _pool, name: &str, params: &[u8]| {
                BdevModule::factory(env, name, params)
            }),
        );
        modules.register(
            crate::cte::MODULE_NAME,
            Arc::new(|env: &ModuleEnv, _pool, _name, _params: &[u8]| Ok(CteModule::factory(env))),
        );
        modules.register(
            crate::cae::MODULE_NAME,
            Arc::new(|env: &ModuleEnv, _pool, _name, _params: &[u8]| Ok(CaeModule::factory(env))),
        );

        let pools = Arc::new(PoolManager::new(Arc::clone(&seg), modules, &config));
        let sched = SchedControl::new(&config);
        crate::ipc::WorkerBoard::create(&seg, config.num_workers as u32, 1024)?;

        let env = ModuleEnv {
            fabric: Arc::clone(&fabric),
            pools: Arc::clone(&pools),
            sched: Arc::clone(&sched),
            io: Arc::new(IoFactory::new()?),
            config: config.clone(),
        };

        let workers = WorkerPool::start(
            Arc::clone(&seg),
            Arc::clone(&fabric),
            Arc::clone(&pools),
            Arc::clone(&sched),
            &config,
        );

        // Built-in pools. The admin control lane is published in the
        // segment header for every client to discover.
        pools.get_or_create(&env, "admin", PoolId::ADMIN, admin::MODULE_NAME, &[])?;
        let admin_container = pools.container(PoolId::ADMIN, 0)?;
        seg.set_admin_lane(admin_container.lanes[0].offset());
        pools.get_or_create(
            &env,
            "cte_core",
            crate::cte::CTE_POOL,
            crate::cte::MODULE_NAME,
            &[],
        )?;
        pools.get_or_create(
            &env,
            "cae_core",
            crate::cae::CAE_POOL,
            crate::cae::MODULE_NAME,
            &[],
        )?;

        let runtime = Arc::new(Self {
            config,
            seg,
            fabric,
            pools,
            sched,
            workers,
            env,
            heartbeat: Mutex::new(None),
        });
        runtime.start_heartbeat()?;
        tracing::info!(
            node = runtime.config.node_id,
            workers = runtime.config.num_workers,
            segment = %runtime.seg.path().display(),
            "runtime started"
        );
        Ok(runtime)
    }

    fn start_heartbeat(&self) -> Result<()> {
        let container = self.pools.container(PoolId::ADMIN, 0)?;
        let lane = container.select_lane(Some(1));
        let future = self.fabric.submit(
            lane,
            SubmitSpec {
                pool: PoolId::ADMIN,
                container_id: 0,
                method: admin::methods::HEARTBEAT,
                payload: Payload::Local(Box::new(admin::HeartbeatTask {
                    node: self.config.node_id,
                })),
                periodic_us: admin::HEARTBEAT_PERIOD_US,
            },
        )?;
        self.sched
            .unpark(lane.header(&self.seg).assigned_worker());
        *self.heartbeat.lock().unwrap() = Some(future);
        Ok(())
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn sched(&self) -> &Arc<SchedControl> {
        &self.sched
    }

    pub fn env(&self) -> &ModuleEnv {
        &self.env
    }

    /// Stop workers, fail parked tasks, and mark the segment shut down.
    pub fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.heartbeat.lock().unwrap().take();
        self.sched.request_stop();
        self.workers.stop_and_join();
        self.seg.mark_shutdown();
    }

    /// Block until a `StopRuntime` task (or signal handler) stops the
    /// scheduler.
    pub fn wait_for_stop(&self) {
        while !self.sched.stopping() {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        self.workers.stop_and_join();
        self.seg.mark_shutdown();
    }
}

/// The process-wide context object injected into every API entry point.
pub struct ContextClient {
    mode: RuntimeMode,
    seg: Arc<Segment>,
    fabric: Arc<IpcFabric>,
    server: Option<Arc<Runtime>>,
    /// Attached-mode lane cache: `(pool, container)` → lane offsets.
    lanes: Mutex<HashMap<(PoolId, ContainerId), Vec<u64>>>,
}

impl ContextClient {
    fn over_server(runtime: Arc<Runtime>, mode: RuntimeMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            seg: Arc::clone(runtime.segment()),
            fabric: Arc::clone(&runtime.env().fabric),
            server: Some(runtime),
            lanes: Mutex::new(HashMap::new()),
        })
    }

    fn attach(config: &RuntimeConfig) -> Result<Arc<Self>> {
        let seg = Arc::new(Segment::attach(&config.segment_path())?);
        if seg.is_shutdown() {
            return Err(RuntimeError::RuntimeShutdown);
        }
        let fabric = Arc::new(IpcFabric::new(
            Arc::clone(&seg),
            Arc::new(CompletionBoard::new()),
            Arc::new(LocalArchive::new()),
            config.send_retries,
        ));
        Ok(Arc::new(Self {
            mode: RuntimeMode::Client,
            seg,
            fabric,
            server: None,
            lanes: Mutex::new(HashMap::new()),
        }))
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    /// The integrated server, when this process hosts one.
    pub fn server(&self) -> Option<&Arc<Runtime>> {
        self.server.as_ref()
    }

    /// Record lane offsets learned from a `GetOrCreatePool` result.
    pub fn cache_lanes(&self, pool: PoolId, lanes: &[(u32, Vec<u64>)]) {
        let mut cache = self.lanes.lock().unwrap();
        for (container, offs) in lanes {
            cache.insert((pool, *container), offs.clone());
        }
    }

    fn lane_for(&self, pool: PoolId, container_id: ContainerId) -> Result<Lane> {
        if let Some(runtime) = &self.server {
            return Ok(runtime
                .pools()
                .container(pool, container_id)?
                .select_lane(None));
        }
        if pool == PoolId::ADMIN {
            let off = self.seg.admin_lane().ok_or(RuntimeError::NotInitialized)?;
            return Ok(Lane::from_offset(off));
        }
        let cache = self.lanes.lock().unwrap();
        let offs = cache
            .get(&(pool, container_id))
            .ok_or_else(|| RuntimeError::PoolNotFound(pool.to_string()))?;
        // Same default selection as the server side.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (pool, container_id).hash(&mut hasher);
        let index = hasher.finish() as usize % offs.len();
        Ok(Lane::from_offset(offs[index]))
    }

    /// Submit a typed task. Same-process submissions take the zero-copy
    /// local archive; attached clients serialize onto the wire.
    pub fn submit<T>(
        &self,
        pool: PoolId,
        container_id: ContainerId,
        method: MethodId,
        query: PoolQuery,
        task: T,
    ) -> Result<TaskFuture>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let lane = self.lane_for(pool, container_id)?;
        if let Some(runtime) = &self.server {
            runtime.pools().route(query)?;
            if runtime.sched().draining() {
                return Err(RuntimeError::RuntimeShutdown);
            }
            let future = self.fabric.submit(
                lane,
                SubmitSpec {
                    pool,
                    container_id,
                    method,
                    payload: Payload::Local(Box::new(task)),
                    periodic_us: 0,
                },
            )?;
            runtime
                .sched()
                .unpark(lane.header(&self.seg).assigned_worker());
            Ok(future)
        } else {
            let bytes = crate::task::to_wire(&task)?;
            self.fabric.submit(
                lane,
                SubmitSpec {
                    pool,
                    container_id,
                    method,
                    payload: Payload::Wire(bytes),
                    periodic_us: 0,
                },
            )
        }
    }

    /// Block on a future and decode its typed result.
    pub fn wait<Out>(&self, future: &TaskFuture) -> Result<Out>
    where
        Out: DeserializeOwned + 'static,
    {
        future.wait()?;
        match future.output()? {
            TaskOutput::Local(any) => Ok(*any
                .downcast::<Out>()
                .map_err(|_| RuntimeError::Serde("result payload type mismatch".into()))?),
            TaskOutput::Wire(bytes) => crate::task::from_wire(&bytes),
        }
    }

    /// Submit and wait in one step.
    pub fn call<T, Out>(
        &self,
        pool: PoolId,
        container_id: ContainerId,
        method: MethodId,
        query: PoolQuery,
        task: T,
    ) -> Result<Out>
    where
        T: Serialize + Send + Sync + 'static,
        Out: DeserializeOwned + 'static,
    {
        let future = self.submit(pool, container_id, method, query, task)?;
        self.wait(&future)
    }

    /// Tear down an integrated server, if any.
    pub fn shutdown(&self) {
        if let Some(runtime) = &self.server {
            runtime.shutdown();
        }
    }
}

static GLOBAL: OnceLock<Mutex<Option<Arc<ContextClient>>>> = OnceLock::new();

fn global() -> &'static Mutex<Option<Arc<ContextClient>>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// Initialize the process-wide context. Idempotent: a second call returns
/// the existing context.
pub fn runtime_init(mode: RuntimeMode, config: RuntimeConfig) -> Result<Arc<ContextClient>> {
    let mut slot = global().lock().unwrap();
    if let Some(existing) = slot.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let client = match mode {
        RuntimeMode::Server => ContextClient::over_server(Runtime::start(config)?, mode),
        RuntimeMode::Client => {
            if RuntimeConfig::integrated_runtime() {
                ContextClient::over_server(Runtime::start(config)?, RuntimeMode::Client)
            } else {
                ContextClient::attach(&config)?
            }
        }
    };
    *slot = Some(Arc::clone(&client));
    Ok(client)
}

/// The process context, if initialized.
pub fn runtime() -> Result<Arc<ContextClient>> {
    global()
        .lock()
        .unwrap()
        .as_ref()
        .cloned()
        .ok_or(RuntimeError::NotInitialized)
}

/// Tear down the process context created by [`runtime_init`].
pub fn runtime_shutdown() {
    let client = global().lock().unwrap().take();
    if let Some(client) = client {
        client.shutdown();
    }
}
