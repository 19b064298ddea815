//! Context Transfer Engine core module: tag/blob metadata, placement over
//! registered targets, and regex query primitives.

mod compress;
mod placement;
mod state;

pub use compress::{Compressor, Identity};
pub use placement::{
    choose_target, choose_victim, desired_kinds, EvictionCandidate, PlacementCandidate,
};
pub use state::{BlobInfo, CteCore, TagId, TagInfo, TargetInfo, CHUNK_SIZE};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bdev::BdevType;
use crate::error::{Result, RuntimeError};
use crate::module::{
    AnyOut, AnyTask, Module, ModuleClient, ModuleEnv, RunContext, TaskBody,
};
use crate::task::{MethodId, PoolId};

pub const MODULE_NAME: &str = "cte_core";
/// Default pool hosting the CTE core container.
pub const CTE_POOL: PoolId = PoolId::new(100, 0);

pub mod methods {
    //! Method-id table for the CTE core module.
    use super::*;

    crate::method_table! {
        module "cte_core";
        0  => CREATE "Create" (CreateParams => CreateResult),
        1  => DESTROY "Destroy" (DestroyTask => DestroyResult),
        9  => MONITOR "Monitor" (MonitorTask => MonitorResult),
        10 => REGISTER_TARGET "RegisterTarget" (RegisterTargetTask => RegisterTargetResult),
        11 => UNREGISTER_TARGET "UnregisterTarget" (UnregisterTargetTask => UnregisterTargetResult),
        12 => LIST_TARGETS "ListTargets" (ListTargetsTask => ListTargetsResult),
        13 => STAT_TARGETS "StatTargets" (ListTargetsTask => ListTargetsResult),
        14 => GET_OR_CREATE_TAG "GetOrCreateTag" (GetOrCreateTagTask => GetOrCreateTagResult),
        15 => PUT_BLOB "PutBlob" (PutBlobTask => PutBlobResult),
        16 => GET_BLOB "GetBlob" (GetBlobTask => GetBlobResult),
        17 => REORGANIZE_BLOB "ReorganizeBlob" (ReorganizeBlobTask => ReorganizeBlobResult),
        18 => DEL_BLOB "DelBlob" (DelBlobTask => DelBlobResult),
        19 => DEL_TAG "DelTag" (DelTagTask => DelTagResult),
        20 => GET_TAG_SIZE "GetTagSize" (GetTagSizeTask => GetTagSizeResult),
        22 => GET_BLOB_SCORE "GetBlobScore" (GetBlobScoreTask => GetBlobScoreResult),
        23 => GET_BLOB_SIZE "GetBlobSize" (GetBlobSizeTask => GetBlobSizeResult),
        24 => GET_CONTAINED_BLOBS "GetContainedBlobs" (GetContainedBlobsTask => GetContainedBlobsResult),
        25 => GET_BLOB_INFO "GetBlobInfo" (GetBlobInfoTask => GetBlobInfoResult),
        30 => TAG_QUERY "TagQuery" (TagQueryTask => TagQueryResult),
        31 => BLOB_QUERY "BlobQuery" (BlobQueryTask => BlobQueryResult),
        32 => GET_TARGET_INFO "GetTargetInfo" (GetTargetInfoTask => GetTargetInfoResult),
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
    pub num_tags: u32,
    pub num_targets: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTargetTask {
    /// `scheme::name`, e.g. `ram::staging` or `file::/tmp/tier2.bin`.
    pub name: String,
    pub kind: BdevType,
    pub capacity: u64,
    pub pool: PoolId,
    pub path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTargetResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterTargetTask {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterTargetResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTargetsTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTargetsResult {
    pub targets: Vec<TargetInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrCreateTagTask {
    pub name: String,
    pub policy: Option<BdevType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrCreateTagResult {
    pub id: TagId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutBlobTask {
    pub tag: String,
    pub blob: String,
    pub off: u64,
    pub data: Vec<u8>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutBlobResult {
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobTask {
    pub tag: String,
    pub blob: String,
    pub off: u64,
    /// 0 reads to the end of the blob.
    pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobResult {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorganizeBlobTask {
    pub tag: String,
    pub blob: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorganizeBlobResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelBlobTask {
    pub tag: String,
    pub blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelBlobResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelTagTask {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelTagResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTagSizeTask {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTagSizeResult {
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobScoreTask {
    pub tag: String,
    pub blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobScoreResult {
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobSizeTask {
    pub tag: String,
    pub blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobSizeResult {
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContainedBlobsTask {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContainedBlobsResult {
    pub blobs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobInfoTask {
    pub tag: String,
    pub blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlobInfoResult {
    pub info: BlobInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagQueryTask {
    pub regex: String,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagQueryResult {
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobQueryTask {
    pub tag_regex: String,
    pub blob_regex: String,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobQueryResult {
    /// `(tag, blob)` pairs.
    pub blobs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTargetInfoTask {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTargetInfoResult {
    pub target: TargetInfo,
}

/// The CTE core container.
pub struct CteModule {
    core: Arc<CteCore>,
}

impl CteModule {
    pub fn factory(env: &ModuleEnv) -> Arc<dyn Module> {
        let client = ModuleClient::new(
            Arc::clone(&env.fabric),
            Arc::clone(&env.pools),
            Arc::clone(&env.sched),
        );
        Arc::new(Self {
            core: Arc::new(CteCore::new(client, Arc::new(Identity))),
        })
    }
}

fn downcast<T: 'static>(task: AnyTask) -> Result<Box<T>> {
    task.downcast::<T>()
        .map_err(|_| RuntimeError::Serde("cte task payload mismatch".into()))
}

impl Module for CteModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn method_name(&self, method: MethodId) -> Option<&'static str> {
        methods::method_name(method)
    }

    fn run(&self, method: MethodId, task: AnyTask, _ctx: RunContext) -> Result<TaskBody> {
        let core = Arc::clone(&self.core);
        match method {
            methods::CREATE => Ok(Box::pin(async move {
                Ok(Box::new(CreateResult {}) as AnyOut)
            })),
            methods::DESTROY => Ok(Box::pin(async move {
                Ok(Box::new(DestroyResult {}) as AnyOut)
            })),
            methods::MONITOR => Ok(Box::pin(async move {
                let report = MonitorResult {
                    num_tags: core.tag_query(".*", u32::MAX)?.len() as u32,
                    num_targets: core.list_targets().len() as u32,
                };
                Ok(Box::new(report) as AnyOut)
            })),
            methods::REGISTER_TARGET => {
                let task = downcast::<RegisterTargetTask>(task)?;
                Ok(Box::pin(async move {
                    core.register_target(task.name, task.kind, task.capacity, task.pool, task.path)
                        .await?;
                    Ok(Box::new(RegisterTargetResult {}) as AnyOut)
                }))
            }
            methods::UNREGISTER_TARGET => {
                let task = downcast::<UnregisterTargetTask>(task)?;
                Ok(Box::pin(async move {
                    core.unregister_target(&task.name)?;
                    Ok(Box::new(UnregisterTargetResult {}) as AnyOut)
                }))
            }
            methods::LIST_TARGETS => Ok(Box::pin(async move {
                Ok(Box::new(ListTargetsResult {
                    targets: core.list_targets(),
                }) as AnyOut)
            })),
            methods::STAT_TARGETS => Ok(Box::pin(async move {
                Ok(Box::new(ListTargetsResult {
                    targets: core.stat_targets().await?,
                }) as AnyOut)
            })),
            methods::GET_OR_CREATE_TAG => {
                let task = downcast::<GetOrCreateTagTask>(task)?;
                Ok(Box::pin(async move {
                    let id = core.get_or_create_tag(&task.name, task.policy);
                    Ok(Box::new(GetOrCreateTagResult { id }) as AnyOut)
                }))
            }
            methods::PUT_BLOB => {
                let task = downcast::<PutBlobTask>(task)?;
                Ok(Box::pin(async move {
                    let bytes = core
                        .put_blob(task.tag, task.blob, task.off, task.data, task.score)
                        .await?;
                    Ok(Box::new(PutBlobResult { bytes }) as AnyOut)
                }))
            }
            methods::GET_BLOB => {
                let task = downcast::<GetBlobTask>(task)?;
                Ok(Box::pin(async move {
                    let data = core
                        .get_blob(task.tag, task.blob, task.off, task.len)
                        .await?;
                    Ok(Box::new(GetBlobResult { data }) as AnyOut)
                }))
            }
            methods::REORGANIZE_BLOB => {
                let task = downcast::<ReorganizeBlobTask>(task)?;
                Ok(Box::pin(async move {
                    core.reorganize_blob(task.tag, task.blob, task.score).await?;
                    Ok(Box::new(ReorganizeBlobResult {}) as AnyOut)
                }))
            }
            methods::DEL_BLOB => {
                let task = downcast::<DelBlobTask>(task)?;
                Ok(Box::pin(async move {
                    core.del_blob(task.tag, task.blob).await?;
                    Ok(Box::new(DelBlobResult {}) as AnyOut)
                }))
            }
            methods::DEL_TAG => {
                let task = downcast::<DelTagTask>(task)?;
                Ok(Box::pin(async move {
                    core.del_tag(task.tag).await?;
                    Ok(Box::new(DelTagResult {}) as AnyOut)
                }))
            }
            methods::GET_TAG_SIZE => {
                let task = downcast::<GetTagSizeTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetTagSizeResult {
                        size: core.tag_size(&task.tag)?,
                    }) as AnyOut)
                }))
            }
            methods::GET_BLOB_SCORE => {
                let task = downcast::<GetBlobScoreTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetBlobScoreResult {
                        score: core.blob_score(&task.tag, &task.blob)?,
                    }) as AnyOut)
                }))
            }
            methods::GET_BLOB_SIZE => {
                let task = downcast::<GetBlobSizeTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetBlobSizeResult {
                        size: core.blob_size(&task.tag, &task.blob)?,
                    }) as AnyOut)
                }))
            }
            methods::GET_CONTAINED_BLOBS => {
                let task = downcast::<GetContainedBlobsTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetContainedBlobsResult {
                        blobs: core.contained_blobs(&task.tag)?,
                    }) as AnyOut)
                }))
            }
            methods::GET_BLOB_INFO => {
                let task = downcast::<GetBlobInfoTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetBlobInfoResult {
                        info: core.blob_info(&task.tag, &task.blob)?,
                    }) as AnyOut)
                }))
            }
            methods::TAG_QUERY => {
                let task = downcast::<TagQueryTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(TagQueryResult {
                        tags: core.tag_query(&task.regex, task.max)?,
                    }) as AnyOut)
                }))
            }
            methods::BLOB_QUERY => {
                let task = downcast::<BlobQueryTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(BlobQueryResult {
                        blobs: core.blob_query(&task.tag_regex, &task.blob_regex, task.max)?,
                    }) as AnyOut)
                }))
            }
            methods::GET_TARGET_INFO => {
                let task = downcast::<GetTargetInfoTask>(task)?;
                Ok(Box::pin(async move {
                    Ok(Box::new(GetTargetInfoResult {
                        target: core.target_info(&task.name)?,
                    }) as AnyOut)
                }))
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

    #[test]
    fn tag_info_serde_preserves_id() {
        let info = TagInfo {
            id: TagId { major: 1, minor: 7 },
            name: "checkpoints".into(),
            policy: Some(BdevType::Ram),
        };
        let bytes = crate::task::to_wire(&info).unwrap();
        let back: TagInfo = crate::task::from_wire(&bytes).unwrap();
        assert_eq!(back.id, info.id);
        assert_eq!(back, info);
    }

    #[test]
    fn method_names_match_table() {
        assert_eq!(methods::method_name(methods::PUT_BLOB), Some("PutBlob"));
        assert_eq!(methods::method_name(methods::TAG_QUERY), Some("TagQuery"));
        assert_eq!(methods::method_name(99), None);
    }
}
