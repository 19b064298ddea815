//! Pools, containers, and module dispatch.
//!
//! The registry resolves `(PoolId → container → method)` for the scheduler
//! and owns the cluster address table. Pool creation is idempotent under the
//! same `(PoolId, pool_name, CreateParams)`; a name or id collision with
//! different parameters is rejected.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::ipc::{IpcFabric, Lane, WorkerBoard};
use crate::mem::Segment;
use crate::module::Module;
use crate::sched::SchedControl;
use crate::task::{ContainerId, PoolId, PoolQuery, WorkerId};

/// Services injected into module factories at container creation.
#[derive(Clone)]
pub struct ModuleEnv {
    pub fabric: Arc<IpcFabric>,
    pub pools: Arc<PoolManager>,
    pub sched: Arc<SchedControl>,
    pub io: Arc<crate::aio::IoFactory>,
    pub config: RuntimeConfig,
}

/// Constructor for a module's container-side instance.
pub type ModuleFactory =
    Arc<dyn Fn(&ModuleEnv, PoolId, &str, &[u8]) -> Result<Arc<dyn Module>> + Send + Sync>;

/// Named module constructors available to pool creation.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: ModuleFactory) {
        self.factories
            .write()
            .unwrap()
            .insert(name.to_string(), factory);
    }

    pub fn instantiate(
        &self,
        env: &ModuleEnv,
        module: &str,
        pool: PoolId,
        pool_name: &str,
        params: &[u8],
    ) -> Result<Arc<dyn Module>> {
        let factory = {
            let factories = self.factories.read().unwrap();
            factories
                .get(module)
                .cloned()
                .ok_or_else(|| RuntimeError::PoolNotFound(format!("module '{module}' not registered")))?
        };
        factory(env, pool, pool_name, params)
    }
}

/// One live container: module instance plus its ingress lanes.
pub struct Container {
    pub pool: PoolId,
    pub id: ContainerId,
    pub module: Arc<dyn Module>,
    pub lanes: Vec<Lane>,
    home_node: AtomicU32,
}

impl Container {
    pub fn home_node(&self) -> u32 {
        self.home_node.load(Ordering::Acquire)
    }

    /// Default lane for a task: `hash(pool, container) % lanes`, unless the
    /// submitter carried an affinity hint.
    pub fn select_lane(&self, affinity: Option<u32>) -> Lane {
        let index = match affinity {
            Some(hint) => hint as usize % self.lanes.len(),
            None => {
                let mut hasher = DefaultHasher::new();
                (self.pool, self.id).hash(&mut hasher);
                hasher.finish() as usize % self.lanes.len()
            }
        };
        self.lanes[index]
    }

    /// Outstanding tasks across this container's lanes.
    pub fn queued_tasks(&self, seg: &Segment) -> u64 {
        self.lanes
            .iter()
            .map(|lane| lane.header(seg).task_count() as u64)
            .sum()
    }
}

/// A named set of containers sharing one module.
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub module: String,
    params_digest: u64,
    containers: RwLock<HashMap<ContainerId, Arc<Container>>>,
}

impl Pool {
    pub fn container(&self, id: ContainerId) -> Option<Arc<Container>> {
        self.containers.read().unwrap().get(&id).cloned()
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.containers.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn remove_container(&self, id: ContainerId) -> Option<Arc<Container>> {
        self.containers.write().unwrap().remove(&id)
    }
}

struct NodeStatus {
    last_heartbeat: Instant,
}

/// The pool/container registry and cluster address table.
pub struct PoolManager {
    seg: Arc<Segment>,
    modules: Arc<ModuleRegistry>,
    node_id: u32,
    num_workers: u32,
    lanes_per_container: u32,
    lane_depth: u32,
    pools: RwLock<HashMap<PoolId, Arc<Pool>>>,
    by_name: RwLock<HashMap<String, PoolId>>,
    nodes: RwLock<HashMap<u32, NodeStatus>>,
    next_worker: AtomicU32,
}

fn digest_params(params: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    hasher.finish()
}

impl PoolManager {
    pub fn new(seg: Arc<Segment>, modules: Arc<ModuleRegistry>, config: &RuntimeConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            config.node_id,
            NodeStatus {
                last_heartbeat: Instant::now(),
            },
        );
        Self {
            seg,
            modules,
            node_id: config.node_id,
            num_workers: config.num_workers as u32,
            lanes_per_container: config.lanes_per_container,
            lane_depth: config.lane_depth,
            pools: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            nodes: RwLock::new(nodes),
            next_worker: AtomicU32::new(0),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Create the pool if absent; idempotent under identical
    /// `(id, name, params)`.
    pub fn get_or_create(
        &self,
        env: &ModuleEnv,
        name: &str,
        id: PoolId,
        module: &str,
        params: &[u8],
    ) -> Result<Arc<Pool>> {
        let digest = digest_params(params);
        {
            let pools = self.pools.read().unwrap();
            if let Some(existing) = pools.get(&id) {
                if existing.name == name && existing.params_digest == digest {
                    return Ok(Arc::clone(existing));
                }
                return Err(RuntimeError::PoolNotFound(format!(
                    "pool {id} already exists as '{}' with different parameters",
                    existing.name
                )));
            }
            if self.by_name.read().unwrap().contains_key(name) {
                return Err(RuntimeError::PoolNotFound(format!(
                    "pool name '{name}' already bound to a different id"
                )));
            }
        }

        let instance = self.modules.instantiate(env, module, id, name, params)?;
        let container = self.build_container(id, 0, instance)?;

        let pool = Arc::new(Pool {
            id,
            name: name.to_string(),
            module: module.to_string(),
            params_digest: digest,
            containers: RwLock::new(HashMap::from([(0, container)])),
        });

        let mut pools = self.pools.write().unwrap();
        // Double-checked: another creator may have raced us.
        if let Some(existing) = pools.get(&id) {
            if existing.name == name && existing.params_digest == digest {
                return Ok(Arc::clone(existing));
            }
            return Err(RuntimeError::PoolNotFound(format!(
                "pool {id} raced into existence with different parameters"
            )));
        }
        pools.insert(id, Arc::clone(&pool));
        self.by_name
            .write()
            .unwrap()
            .insert(name.to_string(), id);
        tracing::info!(pool = %id, name, module, "pool created");
        Ok(pool)
    }

    fn build_container(
        &self,
        pool: PoolId,
        id: ContainerId,
        module: Arc<dyn Module>,
    ) -> Result<Arc<Container>> {
        let mut lanes = Vec::with_capacity(self.lanes_per_container as usize);
        for lane_index in 0..self.lanes_per_container {
            let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_workers.max(1);
            lanes.push(Lane::create(
                &self.seg,
                pool,
                id,
                lane_index,
                worker,
                self.lane_depth,
            )?);
        }
        Ok(Arc::new(Container {
            pool,
            id,
            module,
            lanes,
            home_node: AtomicU32::new(self.node_id),
        }))
    }

    pub fn pool(&self, id: PoolId) -> Result<Arc<Pool>> {
        self.pools
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| RuntimeError::PoolNotFound(id.to_string()))
    }

    pub fn pool_by_name(&self, name: &str) -> Result<Arc<Pool>> {
        let id = *self
            .by_name
            .read()
            .unwrap()
            .get(name)
            .ok_or_else(|| RuntimeError::PoolNotFound(name.to_string()))?;
        self.pool(id)
    }

    pub fn container(&self, pool: PoolId, id: ContainerId) -> Result<Arc<Container>> {
        self.pool(pool)?
            .container(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(format!("{pool}/{id}")))
    }

    /// Drop the pool from dispatch. Callers drain outstanding tasks first.
    pub fn remove_pool(&self, id: PoolId) -> Result<Arc<Pool>> {
        let pool = self
            .pools
            .write()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| RuntimeError::PoolNotFound(id.to_string()))?;
        self.by_name.write().unwrap().remove(&pool.name);
        tracing::info!(pool = %id, name = %pool.name, "pool destroyed");
        Ok(pool)
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.read().unwrap().keys().copied().collect()
    }

    /// Destroy a single container (fatal-task path). The pool survives.
    pub fn remove_container(&self, pool: PoolId, id: ContainerId) -> Result<()> {
        let pool = self.pool(pool)?;
        pool.remove_container(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContainerNotFound(format!("{}/{id}", pool.id)))
    }

    // --- routing -----------------------------------------------------------

    /// Resolve a routing hint to a node id, or fail `unreachable`.
    pub fn route(&self, query: PoolQuery) -> Result<u32> {
        match query {
            PoolQuery::Local => Ok(self.node_id),
            // Single-runtime cluster: dynamic placement lands locally.
            PoolQuery::Dynamic => Ok(self.node_id),
            PoolQuery::Specific(node) => {
                if self.nodes.read().unwrap().contains_key(&node) {
                    Ok(node)
                } else {
                    Err(RuntimeError::Unreachable(node))
                }
            }
        }
    }

    /// Record a node liveness beat, inserting it into the address table.
    pub fn heartbeat(&self, node: u32) {
        self.nodes
            .write()
            .unwrap()
            .entry(node)
            .or_insert_with(|| NodeStatus {
                last_heartbeat: Instant::now(),
            })
            .last_heartbeat = Instant::now();
    }

    /// Age of each known node's last heartbeat, in microseconds.
    pub fn probe(&self) -> Vec<(u32, u64)> {
        let nodes = self.nodes.read().unwrap();
        let mut out: Vec<_> = nodes
            .iter()
            .map(|(node, status)| (*node, status.last_heartbeat.elapsed().as_micros() as u64))
            .collect();
        out.sort_unstable_by_key(|(node, _)| *node);
        out
    }

    // --- migration ---------------------------------------------------------

    /// Hand a container's lanes to a fresh worker and update its home node.
    /// The destination node joins the address table as part of the move.
    pub fn migrate(&self, pool: PoolId, container_id: ContainerId, dest_node: u32) -> Result<()> {
        let container = self.container(pool, container_id)?;
        self.heartbeat(dest_node);
        let new_worker =
            self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_workers.max(1);
        for lane in &container.lanes {
            let header = lane.header(&self.seg);
            loop {
                let current = header.assigned_worker();
                if current == new_worker {
                    break;
                }
                match header.try_reassign(current, new_worker) {
                    Ok(_) => {
                        // The old worker drops the lane on mismatch; make
                        // sure the new one picks it up if work is pending.
                        if header.is_enqueued() {
                            WorkerBoard::deliver(&self.seg, new_worker, lane.offset());
                        }
                        break;
                    }
                    Err(_) => continue,
                }
            }
        }
        container.home_node.store(dest_node, Ordering::Release);
        tracing::info!(
            pool = %pool,
            container = container_id,
            dest_node,
            new_worker,
            "container migrated"
        );
        Ok(())
    }

    /// Sum of queued tasks per worker, for `SystemMonitor`.
    pub fn queued_by_worker(&self) -> HashMap<WorkerId, u64> {
        let mut out: HashMap<WorkerId, u64> = HashMap::new();
        let pools = self.pools.read().unwrap();
        for pool in pools.values() {
            for container in pool.containers.read().unwrap().values() {
                for lane in &container.lanes {
                    let header = lane.header(&self.seg);
                    *out.entry(header.assigned_worker()).or_default() +=
                        header.task_count() as u64;
                }
            }
        }
        out
    }

    /// All lane offsets of all containers (startup delivery + diagnostics).
    pub fn all_lanes(&self) -> Vec<Lane> {
        let pools = self.pools.read().unwrap();
        let mut lanes = Vec::new();
        for pool in pools.values() {
            for container in pool.containers.read().unwrap().values() {
                lanes.extend(container.lanes.iter().copied());
            }
        }
        lanes
    }
}
