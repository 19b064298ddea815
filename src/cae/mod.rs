//! Context Assimilation Engine: manifest-driven ingest into CTE.
//!
//! `ParseManifest` validates the transfer DAG and schedules one
//! `Assimilate` task per entry. Dependency edges are `CoFuture`s: a
//! dependent task parks until its predecessor reaches a terminal state, so
//! completion order is a topological order of the manifest.

pub mod manifest;
pub mod reader;

pub use manifest::{
    expand_env, load_manifest, parse_manifest, split_locator, AssimilationCtx, DatasetFilter,
};
pub use reader::{FileSourceFactory, ReaderRegistry, SourceFactory, SourceStream};

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cte;
use crate::error::{Result, RuntimeError};
use crate::module::{
    AnyOut, AnyTask, Module, ModuleClient, ModuleEnv, RunContext, TaskBody,
};
use crate::sched::CoFuture;
use crate::task::{MethodId, PoolId, PoolQuery};

pub const MODULE_NAME: &str = "cae_core";
/// Default pool hosting the CAE core container.
pub const CAE_POOL: PoolId = PoolId::new(300, 0);
/// Bytes ingested per `put_blob` call.
pub const INGEST_UNIT: u64 = 1024 * 1024;

pub mod methods {
    //! Method-id table for the CAE core module.
    use super::*;

    crate::method_table! {
        module "cae_core";
        0  => CREATE "Create" (CreateParams => CreateResult),
        1  => DESTROY "Destroy" (DestroyTask => DestroyResult),
        9  => MONITOR "Monitor" (MonitorTask => MonitorResult),
        10 => PARSE_MANIFEST "ParseManifest" (ParseManifestTask => ParseManifestResult),
        11 => ASSIMILATE "Assimilate" (AssimilateTask => AssimilateResult),
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
pub struct MonitorResult {
    pub batches_in_flight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseManifestTask {
    pub entries: Vec<AssimilationCtx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseManifestResult {
    pub num_tasks_scheduled: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssimilateTask {
    pub ctx: AssimilationCtx,
    pub batch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssimilateResult {
    pub bytes_ingested: u64,
}

/// Reject duplicate destinations, unknown predecessors, and cycles.
fn validate_dag(entries: &[AssimilationCtx]) -> Result<()> {
    let mut by_dst: HashMap<&str, usize> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        if by_dst.insert(entry.dst.as_str(), i).is_some() {
            return Err(RuntimeError::ManifestInvalid(format!(
                "duplicate dst '{}'",
                entry.dst
            )));
        }
    }
    for entry in entries {
        if entry.depends_on.is_empty() {
            continue;
        }
        if !by_dst.contains_key(entry.depends_on.as_str()) {
            return Err(RuntimeError::ManifestInvalid(format!(
                "'{}' depends on unknown transfer '{}'",
                entry.dst, entry.depends_on
            )));
        }
    }
    // Each entry has at most one predecessor, so cycle detection is chain
    // walking with a visited set.
    for (start, _) in entries.iter().enumerate() {
        let mut seen = HashSet::new();
        let mut at = start;
        loop {
            if !seen.insert(at) {
                return Err(RuntimeError::ManifestInvalid(format!(
                    "dependency cycle through '{}'",
                    entries[at].dst
                )));
            }
            let dep = &entries[at].depends_on;
            if dep.is_empty() {
                break;
            }
            at = by_dst[dep.as_str()];
        }
    }
    Ok(())
}

struct CaeInner {
    client: ModuleClient,
    readers: Arc<ReaderRegistry>,
    /// batch id → (dst → completion signal).
    batches: Mutex<HashMap<u64, HashMap<String, CoFuture<()>>>>,
    next_batch: AtomicU64,
}

impl CaeInner {
    fn signal(&self, batch: u64, dst: &str) -> Option<CoFuture<()>> {
        self.batches
            .lock()
            .unwrap()
            .get(&batch)
            .and_then(|m| m.get(dst))
            .cloned()
    }

    /// Schedule one `Assimilate` per entry and wait for the batch to reach
    /// terminal states; the count reports what was scheduled.
    async fn parse_manifest(
        self: Arc<Self>,
        pool: PoolId,
        container_id: u32,
        task: ParseManifestTask,
    ) -> Result<AnyOut> {
        let entries = task.entries;
        if entries.is_empty() {
            return Ok(Box::new(ParseManifestResult {
                num_tasks_scheduled: 0,
            }));
        }
        validate_dag(&entries)?;

        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        {
            let signals = entries
                .iter()
                .map(|e| (e.dst.clone(), CoFuture::new()))
                .collect();
            self.batches.lock().unwrap().insert(batch, signals);
        }

        let mut futures = Vec::with_capacity(entries.len());
        for ctx in &entries {
            let future = self.client.submit(
                pool,
                container_id,
                methods::ASSIMILATE,
                PoolQuery::Local,
                AssimilateTask {
                    ctx: ctx.clone(),
                    batch,
                },
            )?;
            futures.push(future);
        }
        let num_tasks_scheduled = futures.len() as u32;
        tracing::info!(batch, num_tasks_scheduled, "assimilation batch scheduled");

        let mut first_err = None;
        for future in &futures {
            if let Err(err) = future.join().await {
                first_err.get_or_insert(err);
            }
        }
        self.batches.lock().unwrap().remove(&batch);
        match first_err {
            Some(err) => Err(err),
            None => Ok(Box::new(ParseManifestResult {
                num_tasks_scheduled,
            })),
        }
    }

    /// Wait for the predecessor, then stream the source into CTE.
    async fn assimilate(self: Arc<Self>, task: AssimilateTask) -> Result<AnyOut> {
        if !task.ctx.depends_on.is_empty() {
            if let Some(signal) = self.signal(task.batch, &task.ctx.depends_on) {
                signal.wait().await;
            }
        }

        let result = self.ingest_entry(&task.ctx).await;

        // Dependents run when this task is terminal, success or not.
        if let Some(signal) = self.signal(task.batch, &task.ctx.dst) {
            signal.complete(());
        }
        result.map(|bytes_ingested| Box::new(AssimilateResult { bytes_ingested }) as AnyOut)
    }

    async fn ingest_entry(&self, ctx: &AssimilationCtx) -> Result<u64> {
        let (dst_scheme, tag_name) = split_locator(&ctx.dst)?;
        if dst_scheme != "iowarp" {
            return Err(RuntimeError::ManifestInvalid(format!(
                "unsupported destination scheme '{dst_scheme}'"
            )));
        }
        let _tag: cte::GetOrCreateTagResult = self
            .client
            .call(
                cte::CTE_POOL,
                0,
                cte::methods::GET_OR_CREATE_TAG,
                cte::GetOrCreateTagTask {
                    name: tag_name.to_string(),
                    policy: None,
                },
            )
            .await?;

        let (_, src_path) = split_locator(&ctx.src)?;
        let default_name = std::path::Path::new(src_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());

        let streams = self.readers.open(ctx)?;
        let mut total = 0u64;
        for mut stream in streams {
            let blob_name = if stream.name.is_empty() {
                default_name.clone()
            } else {
                stream.name.clone()
            };
            let mut offset = 0u64;
            loop {
                let mut unit = vec![0u8; INGEST_UNIT as usize];
                let mut filled = 0usize;
                while filled < unit.len() {
                    match stream.reader.read(&mut unit[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(RuntimeError::io(err)),
                    }
                }
                if filled == 0 {
                    break;
                }
                unit.truncate(filled);
                let _put: cte::PutBlobResult = self
                    .client
                    .call(
                        cte::CTE_POOL,
                        0,
                        cte::methods::PUT_BLOB,
                        cte::PutBlobTask {
                            tag: tag_name.to_string(),
                            blob: blob_name.clone(),
                            off: offset,
                            data: unit,
                            score: 1.0,
                        },
                    )
                    .await?;
                offset += filled as u64;
                total += filled as u64;
                if filled < INGEST_UNIT as usize {
                    break;
                }
            }
        }
        tracing::info!(src = %ctx.src, dst = %ctx.dst, bytes = total, "transfer assimilated");
        Ok(total)
    }
}

/// The CAE core container.
pub struct CaeModule {
    inner: Arc<CaeInner>,
}

impl CaeModule {
    pub fn factory(env: &ModuleEnv) -> Arc<dyn Module> {
        let client = ModuleClient::new(
            Arc::clone(&env.fabric),
            Arc::clone(&env.pools),
            Arc::clone(&env.sched),
        );
        Arc::new(Self {
            inner: Arc::new(CaeInner {
                client,
                readers: Arc::new(ReaderRegistry::new()),
                batches: Mutex::new(HashMap::new()),
                next_batch: AtomicU64::new(1),
            }),
        })
    }
}

fn downcast<T: 'static>(task: AnyTask) -> Result<Box<T>> {
    task.downcast::<T>()
        .map_err(|_| RuntimeError::Serde("cae task payload mismatch".into()))
}

impl Module for CaeModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn method_name(&self, method: MethodId) -> Option<&'static str> {
        methods::method_name(method)
    }

    fn run(&self, method: MethodId, task: AnyTask, ctx: RunContext) -> Result<TaskBody> {
        let inner = Arc::clone(&self.inner);
        match method {
            methods::CREATE => Ok(Box::pin(async move {
                Ok(Box::new(CreateResult {}) as AnyOut)
            })),
            methods::DESTROY => Ok(Box::pin(async move {
                Ok(Box::new(DestroyResult {}) as AnyOut)
            })),
            methods::MONITOR => Ok(Box::pin(async move {
                let report = MonitorResult {
                    batches_in_flight: inner.batches.lock().unwrap().len() as u32,
                };
                Ok(Box::new(report) as AnyOut)
            })),
            methods::PARSE_MANIFEST => {
                let task = downcast::<ParseManifestTask>(task)?;
                let (pool, container_id) = (ctx.pool, ctx.container_id);
                Ok(Box::pin(async move {
                    inner.parse_manifest(pool, container_id, *task).await
                }))
            }
            methods::ASSIMILATE => {
                let task = downcast::<AssimilateTask>(task)?;
                Ok(Box::pin(async move { inner.assimilate(*task).await }))
            }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dst: &str, depends_on: &str) -> AssimilationCtx {
        AssimilationCtx {
            src: "file::/tmp/x".into(),
            dst: dst.into(),
            format: "binary".into(),
            depends_on: depends_on.into(),
            range_off: 0,
            range_size: 0,
            src_token: String::new(),
            dst_token: String::new(),
            dataset_filter: None,
        }
    }

    #[test]
    fn dag_accepts_chains() {
        let entries = vec![
            entry("iowarp::a", ""),
            entry("iowarp::b", "iowarp::a"),
            entry("iowarp::c", "iowarp::b"),
        ];
        assert!(validate_dag(&entries).is_ok());
    }

    #[test]
    fn dag_rejects_unknown_predecessor() {
        let entries = vec![entry("iowarp::a", "iowarp::ghost")];
        assert!(matches!(
            validate_dag(&entries),
            Err(RuntimeError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn dag_rejects_cycles() {
        let entries = vec![
            entry("iowarp::a", "iowarp::b"),
            entry("iowarp::b", "iowarp::a"),
        ];
        assert!(matches!(
            validate_dag(&entries),
            Err(RuntimeError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn dag_rejects_duplicate_dst() {
        let entries = vec![entry("iowarp::a", ""), entry("iowarp::a", "")];
        assert!(matches!(
            validate_dag(&entries),
            Err(RuntimeError::ManifestInvalid(_))
        ));
    }
}
