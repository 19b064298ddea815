//! Typed client wrappers over the IPC fabric.
//!
//! Thin synchronous facades for the built-in modules, plus the
//! `ContextInterface` bundle/query/destroy surface consumed by the CLI and
//! external adapters.

use std::sync::Arc;

use crate::admin::{self, MigrateInfo};
use crate::bdev::BdevType;
use crate::cae;
use crate::cte;
use crate::error::{Result, RuntimeError};
use crate::runtime::ContextClient;
use crate::task::{PoolId, PoolQuery};

/// Client for the admin container on pool `(0,0)`.
pub struct AdminClient {
    ctx: Arc<ContextClient>,
}

impl AdminClient {
    pub fn new(ctx: Arc<ContextClient>) -> Self {
        Self { ctx }
    }

    pub fn get_or_create_pool(
        &self,
        name: &str,
        id: PoolId,
        module: &str,
        params: Vec<u8>,
    ) -> Result<admin::GetOrCreatePoolResult> {
        let result: admin::GetOrCreatePoolResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::GET_OR_CREATE_POOL,
            PoolQuery::Local,
            admin::GetOrCreatePoolTask {
                name: name.to_string(),
                id,
                module: module.to_string(),
                params,
            },
        )?;
        self.ctx.cache_lanes(result.id, &result.lanes);
        Ok(result)
    }

    pub fn destroy_pool(&self, id: PoolId) -> Result<()> {
        let _: admin::DestroyPoolResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::DESTROY_POOL,
            PoolQuery::Local,
            admin::DestroyPoolTask { id },
        )?;
        Ok(())
    }

    pub fn stop_runtime(&self) -> Result<()> {
        let _: admin::StopRuntimeResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::STOP_RUNTIME,
            PoolQuery::Local,
            admin::StopRuntimeTask {},
        )?;
        Ok(())
    }

    pub fn system_monitor(&self) -> Result<admin::SystemMonitorResult> {
        self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::SYSTEM_MONITOR,
            PoolQuery::Local,
            admin::SystemMonitorTask {},
        )
    }

    pub fn migrate_containers(
        &self,
        migrations: Vec<MigrateInfo>,
    ) -> Result<admin::MigrateContainersResult> {
        self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::MIGRATE_CONTAINERS,
            PoolQuery::Local,
            admin::MigrateContainersTask { migrations },
        )
    }

    pub fn submit_batch(&self, entries: Vec<admin::BatchEntry>) -> Result<u32> {
        let result: admin::SubmitBatchResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::SUBMIT_BATCH,
            PoolQuery::Local,
            admin::SubmitBatchTask { entries },
        )?;
        Ok(result.num_submitted)
    }

    pub fn register_memory(&self, name: &str, size: u64) -> Result<u32> {
        let result: admin::RegisterMemoryResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::REGISTER_MEMORY,
            PoolQuery::Local,
            admin::RegisterMemoryTask {
                name: name.to_string(),
                size,
            },
        )?;
        Ok(result.region_id)
    }

    pub fn heartbeat_probe(&self) -> Result<admin::HeartbeatProbeResult> {
        self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::HEARTBEAT_PROBE,
            PoolQuery::Local,
            admin::HeartbeatProbeTask {},
        )
    }

    pub fn announce_shutdown(&self) -> Result<()> {
        let _: admin::AnnounceShutdownResult = self.ctx.call(
            PoolId::ADMIN,
            0,
            admin::methods::ANNOUNCE_SHUTDOWN,
            PoolQuery::Local,
            admin::AnnounceShutdownTask {},
        )?;
        Ok(())
    }
}

/// Client for the CTE core container.
pub struct CteClient {
    ctx: Arc<ContextClient>,
    pool: PoolId,
}

impl CteClient {
    /// Bind to the default CTE pool, creating it if this client is first.
    pub fn new(ctx: Arc<ContextClient>) -> Result<Self> {
        AdminClient::new(Arc::clone(&ctx)).get_or_create_pool(
            "cte_core",
            cte::CTE_POOL,
            cte::MODULE_NAME,
            Vec::new(),
        )?;
        Ok(Self {
            ctx,
            pool: cte::CTE_POOL,
        })
    }

    pub fn register_target(
        &self,
        name: &str,
        kind: BdevType,
        capacity: u64,
        pool: PoolId,
    ) -> Result<()> {
        let _: cte::RegisterTargetResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::REGISTER_TARGET,
            PoolQuery::Local,
            cte::RegisterTargetTask {
                name: name.to_string(),
                kind,
                capacity,
                pool,
                path: None,
            },
        )?;
        Ok(())
    }

    pub fn get_or_create_tag(&self, name: &str) -> Result<cte::TagId> {
        self.get_or_create_tag_with_policy(name, None)
    }

    /// Create a tag pinned to one device class.
    pub fn get_or_create_tag_with_policy(
        &self,
        name: &str,
        policy: Option<BdevType>,
    ) -> Result<cte::TagId> {
        let result: cte::GetOrCreateTagResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::GET_OR_CREATE_TAG,
            PoolQuery::Local,
            cte::GetOrCreateTagTask {
                name: name.to_string(),
                policy,
            },
        )?;
        Ok(result.id)
    }

    pub fn put_blob(
        &self,
        tag: &str,
        blob: &str,
        off: u64,
        data: Vec<u8>,
        score: f32,
    ) -> Result<u64> {
        let result: cte::PutBlobResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::PUT_BLOB,
            PoolQuery::Local,
            cte::PutBlobTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
                off,
                data,
                score,
            },
        )?;
        Ok(result.bytes)
    }

    pub fn get_blob(&self, tag: &str, blob: &str, off: u64, len: u64) -> Result<Vec<u8>> {
        let result: cte::GetBlobResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::GET_BLOB,
            PoolQuery::Local,
            cte::GetBlobTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
                off,
                len,
            },
        )?;
        Ok(result.data)
    }

    pub fn del_blob(&self, tag: &str, blob: &str) -> Result<()> {
        let _: cte::DelBlobResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::DEL_BLOB,
            PoolQuery::Local,
            cte::DelBlobTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn del_tag(&self, tag: &str) -> Result<()> {
        let _: cte::DelTagResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::DEL_TAG,
            PoolQuery::Local,
            cte::DelTagTask {
                tag: tag.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn get_blob_size(&self, tag: &str, blob: &str) -> Result<u64> {
        let result: cte::GetBlobSizeResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::GET_BLOB_SIZE,
            PoolQuery::Local,
            cte::GetBlobSizeTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
            },
        )?;
        Ok(result.size)
    }

    pub fn get_contained_blobs(&self, tag: &str) -> Result<Vec<String>> {
        let result: cte::GetContainedBlobsResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::GET_CONTAINED_BLOBS,
            PoolQuery::Local,
            cte::GetContainedBlobsTask {
                tag: tag.to_string(),
            },
        )?;
        Ok(result.blobs)
    }

    pub fn get_blob_info(&self, tag: &str, blob: &str) -> Result<cte::BlobInfo> {
        let result: cte::GetBlobInfoResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::GET_BLOB_INFO,
            PoolQuery::Local,
            cte::GetBlobInfoTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
            },
        )?;
        Ok(result.info)
    }

    pub fn reorganize_blob(&self, tag: &str, blob: &str, score: f32) -> Result<()> {
        let _: cte::ReorganizeBlobResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::REORGANIZE_BLOB,
            PoolQuery::Local,
            cte::ReorganizeBlobTask {
                tag: tag.to_string(),
                blob: blob.to_string(),
                score,
            },
        )?;
        Ok(())
    }

    pub fn tag_query(&self, regex: &str, max: u32) -> Result<Vec<String>> {
        let result: cte::TagQueryResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::TAG_QUERY,
            PoolQuery::Local,
            cte::TagQueryTask {
                regex: regex.to_string(),
                max,
            },
        )?;
        Ok(result.tags)
    }

    pub fn blob_query(
        &self,
        tag_regex: &str,
        blob_regex: &str,
        max: u32,
    ) -> Result<Vec<(String, String)>> {
        let result: cte::BlobQueryResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::BLOB_QUERY,
            PoolQuery::Local,
            cte::BlobQueryTask {
                tag_regex: tag_regex.to_string(),
                blob_regex: blob_regex.to_string(),
                max,
            },
        )?;
        Ok(result.blobs)
    }

    pub fn list_targets(&self) -> Result<Vec<cte::TargetInfo>> {
        let result: cte::ListTargetsResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::LIST_TARGETS,
            PoolQuery::Local,
            cte::ListTargetsTask {},
        )?;
        Ok(result.targets)
    }

    pub fn stat_targets(&self) -> Result<Vec<cte::TargetInfo>> {
        let result: cte::ListTargetsResult = self.ctx.call(
            self.pool,
            0,
            cte::methods::STAT_TARGETS,
            PoolQuery::Local,
            cte::ListTargetsTask {},
        )?;
        Ok(result.targets)
    }
}

/// Client for the CAE core container.
pub struct CaeClient {
    ctx: Arc<ContextClient>,
    pool: PoolId,
}

impl CaeClient {
    pub fn new(ctx: Arc<ContextClient>) -> Result<Self> {
        AdminClient::new(Arc::clone(&ctx)).get_or_create_pool(
            "cae_core",
            cae::CAE_POOL,
            cae::MODULE_NAME,
            Vec::new(),
        )?;
        Ok(Self {
            ctx,
            pool: cae::CAE_POOL,
        })
    }

    /// Schedule one assimilation task per entry; returns the count.
    pub fn parse_manifest(&self, entries: Vec<cae::AssimilationCtx>) -> Result<u32> {
        let result: cae::ParseManifestResult = self.ctx.call(
            self.pool,
            0,
            cae::methods::PARSE_MANIFEST,
            PoolQuery::Local,
            cae::ParseManifestTask { entries },
        )?;
        Ok(result.num_tasks_scheduled)
    }
}

/// Bundle/query/destroy surface over CAE + CTE.
pub struct ContextInterface {
    cte: CteClient,
    cae: CaeClient,
}

impl ContextInterface {
    pub fn new(ctx: Arc<ContextClient>) -> Result<Self> {
        Ok(Self {
            cte: CteClient::new(Arc::clone(&ctx))?,
            cae: CaeClient::new(ctx)?,
        })
    }

    pub fn cte(&self) -> &CteClient {
        &self.cte
    }

    /// Ingest a bundle of transfers. An empty bundle schedules nothing and
    /// succeeds.
    pub fn context_bundle(&self, entries: Vec<cae::AssimilationCtx>) -> Result<u32> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.cae.parse_manifest(entries)
    }

    /// Blob names under `tag` matching `blob_regex`.
    pub fn context_query(&self, tag: &str, blob_regex: &str) -> Result<Vec<String>> {
        let pairs = self
            .cte
            .blob_query(&format!("^{}$", regex::escape(tag)), blob_regex, u32::MAX)?;
        Ok(pairs.into_iter().map(|(_, blob)| blob).collect())
    }

    /// Delete the named tags and everything under them. Missing tags are
    /// reported, present tags are still removed.
    pub fn context_destroy(&self, tags: &[String]) -> Result<u32> {
        let mut destroyed = 0;
        let mut missing = None;
        for tag in tags {
            match self.cte.del_tag(tag) {
                Ok(()) => destroyed += 1,
                Err(RuntimeError::TagNotFound(name)) => {
                    missing.get_or_insert(name);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(name) = missing {
            return Err(RuntimeError::TagNotFound(name));
        }
        Ok(destroyed)
    }
}
