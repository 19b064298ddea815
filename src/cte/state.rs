//! Tag/blob metadata and the chunk data plane.
//!
//! Blobs are ordered lists of fixed-size chunks placed on registered
//! targets. All chunk I/O goes through bdev sub-tasks, so CTE handlers are
//! cooperative: they await allocation, reads, and writes without pinning
//! their worker. A per-blob `CoMutex` serializes overlapping `put_blob`s;
//! the tag directory and each target's resident index sit behind
//! reader-writer locks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bdev::{self, BdevType, Extent};
use crate::error::{Result, RuntimeError};
use crate::module::ModuleClient;
use crate::sched::CoMutex;
use crate::task::PoolId;

use super::compress::Compressor;
use super::placement::{self, EvictionCandidate, PlacementCandidate};

/// Fixed chunk size: 256 KiB.
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Regex-indexable tag identifier, regenerated on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagId {
    pub major: u32,
    pub minor: u32,
}

/// Serializable tag descriptor (`serialize → deserialize` preserves `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub id: TagId,
    pub name: String,
    pub policy: Option<BdevType>,
}

/// Registered-target descriptor returned by list/stat operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub name: String,
    pub kind: BdevType,
    pub pool: PoolId,
    pub capacity: u64,
    pub free: u64,
}

/// Blob descriptor for `GetBlobInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
    pub score: f32,
    pub resident: bool,
    pub num_chunks: u32,
    pub targets: Vec<String>,
}

pub(super) struct TargetEntry {
    pub name: String,
    pub kind: BdevType,
    pub pool: PoolId,
    pub capacity: u64,
    free: AtomicU64,
    /// `(tag, blob)` pairs with resident chunks here.
    resident: RwLock<HashSet<(String, String)>>,
}

impl TargetEntry {
    fn free_bytes(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }

    fn adjust_free(&self, delta: i64) {
        if delta >= 0 {
            self.free.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.free.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    fn info(&self) -> TargetInfo {
        TargetInfo {
            name: self.name.clone(),
            kind: self.kind,
            pool: self.pool,
            capacity: self.capacity,
            free: self.free_bytes(),
        }
    }
}

/// One placed chunk. `valid` is the logical byte count, `stored` the
/// on-target (possibly transformed) byte count.
struct ChunkRef {
    index: u64,
    target: Arc<TargetEntry>,
    extents: Vec<Extent>,
    valid: u64,
    stored: u64,
    digest: [u8; 32],
}

#[derive(Default)]
struct BlobMeta {
    size: u64,
    score: f32,
    resident: bool,
    last_access: Option<Instant>,
    chunks: Vec<ChunkRef>,
    /// Spill copies on a persistent target, kept for rematerialization.
    backing: Vec<ChunkRef>,
}

pub(super) struct BlobEntry {
    name: String,
    lock: CoMutex,
    meta: Mutex<BlobMeta>,
}

pub(super) struct TagEntry {
    pub id: TagId,
    pub name: String,
    pub policy: Option<BdevType>,
    blobs: RwLock<HashMap<String, Arc<BlobEntry>>>,
}

impl TagEntry {
    pub fn info(&self) -> TagInfo {
        TagInfo {
            id: self.id,
            name: self.name.clone(),
            policy: self.policy,
        }
    }
}

/// Container-side CTE state.
pub struct CteCore {
    client: ModuleClient,
    compressor: Arc<dyn Compressor>,
    tags: RwLock<HashMap<String, Arc<TagEntry>>>,
    by_id: RwLock<HashMap<TagId, String>>,
    next_minor: AtomicU32,
    targets: RwLock<Vec<Arc<TargetEntry>>>,
}

impl CteCore {
    pub fn new(client: ModuleClient, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            client,
            compressor,
            tags: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            next_minor: AtomicU32::new(1),
            targets: RwLock::new(Vec::new()),
        }
    }

    // --- targets -----------------------------------------------------------

    /// Register a block device: creates its bdev pool and adds it to the
    /// placement set.
    pub async fn register_target(
        self: Arc<Self>,
        name: String,
        kind: BdevType,
        capacity: u64,
        pool: PoolId,
        path: Option<std::path::PathBuf>,
    ) -> Result<()> {
        {
            let targets = self.targets.read().unwrap();
            if targets.iter().any(|t| t.name == name) {
                return Ok(()); // registration is idempotent by name
            }
        }
        let params = crate::task::to_wire(&bdev::CreateParams {
            name: name.clone(),
            kind,
            capacity,
            path,
        })?;
        let _result: crate::admin::GetOrCreatePoolResult = self
            .client
            .call(
                PoolId::ADMIN,
                0,
                crate::admin::methods::GET_OR_CREATE_POOL,
                crate::admin::GetOrCreatePoolTask {
                    name: name.clone(),
                    id: pool,
                    module: bdev::MODULE_NAME.to_string(),
                    params,
                },
            )
            .await?;
        let mut targets = self.targets.write().unwrap();
        // A concurrent registrant may have won between the check and the
        // (idempotent) pool creation above.
        if !targets.iter().any(|t| t.name == name) {
            targets.push(Arc::new(TargetEntry {
                name,
                kind,
                pool,
                capacity,
                free: AtomicU64::new(capacity),
                resident: RwLock::new(HashSet::new()),
            }));
        }
        Ok(())
    }

    pub fn unregister_target(&self, name: &str) -> Result<()> {
        let mut targets = self.targets.write().unwrap();
        let index = targets
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| RuntimeError::TagNotFound(format!("target '{name}'")))?;
        if !targets[index].resident.read().unwrap().is_empty() {
            return Err(RuntimeError::Unsupported(format!(
                "target '{name}' still hosts resident blobs"
            )));
        }
        targets.remove(index);
        Ok(())
    }

    pub fn list_targets(&self) -> Vec<TargetInfo> {
        self.targets
            .read()
            .unwrap()
            .iter()
            .map(|t| t.info())
            .collect()
    }

    pub fn target_info(&self, name: &str) -> Result<TargetInfo> {
        self.targets
            .read()
            .unwrap()
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.info())
            .ok_or_else(|| RuntimeError::TagNotFound(format!("target '{name}'")))
    }

    /// Refresh free-space caches from the devices, then report.
    pub async fn stat_targets(self: Arc<Self>) -> Result<Vec<TargetInfo>> {
        let targets: Vec<Arc<TargetEntry>> = self.targets.read().unwrap().clone();
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            let stats: bdev::BdevStats = self
                .client
                .call(
                    target.pool,
                    0,
                    bdev::methods::GET_STATS,
                    bdev::MonitorTask {},
                )
                .await?;
            target.free.store(stats.free, Ordering::Release);
            out.push(target.info());
        }
        Ok(out)
    }

    fn target_candidates(&self) -> Vec<PlacementCandidate> {
        self.targets
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(index, t)| PlacementCandidate {
                index,
                kind: t.kind,
                free: t.free_bytes(),
            })
            .collect()
    }

    fn target_at(&self, index: usize) -> Option<Arc<TargetEntry>> {
        self.targets.read().unwrap().get(index).cloned()
    }

    // --- tags --------------------------------------------------------------

    pub fn get_or_create_tag(&self, name: &str, policy: Option<BdevType>) -> TagId {
        if let Some(tag) = self.tags.read().unwrap().get(name) {
            return tag.id;
        }
        let mut tags = self.tags.write().unwrap();
        if let Some(tag) = tags.get(name) {
            return tag.id;
        }
        let id = TagId {
            major: 1,
            minor: self.next_minor.fetch_add(1, Ordering::Relaxed),
        };
        tags.insert(
            name.to_string(),
            Arc::new(TagEntry {
                id,
                name: name.to_string(),
                policy,
                blobs: RwLock::new(HashMap::new()),
            }),
        );
        self.by_id.write().unwrap().insert(id, name.to_string());
        tracing::debug!(tag = name, ?id, "tag created");
        id
    }

    pub(super) fn tag(&self, name: &str) -> Result<Arc<TagEntry>> {
        self.tags
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::TagNotFound(name.to_string()))
    }

    pub fn tag_info(&self, name: &str) -> Result<TagInfo> {
        Ok(self.tag(name)?.info())
    }

    /// Tag names matching `regex`, capped at `max`.
    pub fn tag_query(&self, pattern: &str, max: u32) -> Result<Vec<String>> {
        let re = regex::Regex::new(pattern)
            .map_err(|err| RuntimeError::ManifestInvalid(format!("bad tag regex: {err}")))?;
        let tags = self.tags.read().unwrap();
        let mut names: Vec<String> = tags.keys().filter(|n| re.is_match(n)).cloned().collect();
        names.sort_unstable();
        names.truncate(max as usize);
        Ok(names)
    }

    /// `(tag, blob)` pairs matching both patterns, capped at `max`.
    pub fn blob_query(
        &self,
        tag_pattern: &str,
        blob_pattern: &str,
        max: u32,
    ) -> Result<Vec<(String, String)>> {
        let tag_re = regex::Regex::new(tag_pattern)
            .map_err(|err| RuntimeError::ManifestInvalid(format!("bad tag regex: {err}")))?;
        let blob_re = regex::Regex::new(blob_pattern)
            .map_err(|err| RuntimeError::ManifestInvalid(format!("bad blob regex: {err}")))?;
        let tags = self.tags.read().unwrap();
        let mut out = Vec::new();
        let mut names: Vec<&String> = tags.keys().filter(|n| tag_re.is_match(n)).collect();
        names.sort_unstable();
        'outer: for name in names {
            let tag = &tags[name];
            let mut blobs: Vec<String> = tag
                .blobs
                .read()
                .unwrap()
                .keys()
                .filter(|b| blob_re.is_match(b))
                .cloned()
                .collect();
            blobs.sort_unstable();
            for blob in blobs {
                if out.len() >= max as usize {
                    break 'outer;
                }
                out.push((name.clone(), blob));
            }
        }
        Ok(out)
    }

    pub fn contained_blobs(&self, tag_name: &str) -> Result<Vec<String>> {
        let tag = self.tag(tag_name)?;
        let mut names: Vec<String> = tag.blobs.read().unwrap().keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    pub fn tag_size(&self, tag_name: &str) -> Result<u64> {
        let tag = self.tag(tag_name)?;
        let blobs = tag.blobs.read().unwrap();
        Ok(blobs
            .values()
            .map(|b| b.meta.lock().unwrap().size)
            .sum())
    }

    // --- blob metadata ------------------------------------------------------

    fn blob(&self, tag: &TagEntry, name: &str) -> Result<Arc<BlobEntry>> {
        tag.blobs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::BlobNotFound(format!("{}/{name}", tag.name)))
    }

    fn blob_or_create(&self, tag: &TagEntry, name: &str) -> Arc<BlobEntry> {
        if let Some(blob) = tag.blobs.read().unwrap().get(name) {
            return Arc::clone(blob);
        }
        let mut blobs = tag.blobs.write().unwrap();
        Arc::clone(blobs.entry(name.to_string()).or_insert_with(|| {
            Arc::new(BlobEntry {
                name: name.to_string(),
                lock: CoMutex::new(),
                meta: Mutex::new(BlobMeta::default()),
            })
        }))
    }

    pub fn blob_size(&self, tag_name: &str, blob_name: &str) -> Result<u64> {
        let tag = self.tag(tag_name)?;
        let blob = self.blob(&tag, blob_name)?;
        let size = blob.meta.lock().unwrap().size;
        Ok(size)
    }

    pub fn blob_score(&self, tag_name: &str, blob_name: &str) -> Result<f32> {
        let tag = self.tag(tag_name)?;
        let blob = self.blob(&tag, blob_name)?;
        let score = blob.meta.lock().unwrap().score;
        Ok(score)
    }

    pub fn blob_info(&self, tag_name: &str, blob_name: &str) -> Result<BlobInfo> {
        let tag = self.tag(tag_name)?;
        let blob = self.blob(&tag, blob_name)?;
        let meta = blob.meta.lock().unwrap();
        let mut targets: Vec<String> = meta
            .chunks
            .iter()
            .map(|c| c.target.name.clone())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        Ok(BlobInfo {
            name: blob.name.clone(),
            size: meta.size,
            score: meta.score,
            resident: meta.resident,
            num_chunks: meta.chunks.len() as u32,
            targets,
        })
    }

    // --- chunk I/O helpers --------------------------------------------------

    async fn bdev_write(&self, target: &TargetEntry, extents: &[Extent], data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        for extent in extents {
            if cursor >= data.len() {
                break;
            }
            let take = (extent.len as usize).min(data.len() - cursor);
            let _res: bdev::WriteResult = self
                .client
                .call(
                    target.pool,
                    0,
                    bdev::methods::WRITE,
                    bdev::WriteTask {
                        off: extent.off,
                        data: data[cursor..cursor + take].to_vec(),
                    },
                )
                .await?;
            cursor += take;
        }
        Ok(())
    }

    async fn bdev_read(&self, target: &TargetEntry, extents: &[Extent], len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        for extent in extents {
            if out.len() as u64 >= len {
                break;
            }
            let take = extent.len.min(len - out.len() as u64);
            let res: bdev::ReadResult = self
                .client
                .call(
                    target.pool,
                    0,
                    bdev::methods::READ,
                    bdev::ReadTask {
                        off: extent.off,
                        len: take,
                    },
                )
                .await?;
            out.extend_from_slice(&res.data);
        }
        out.truncate(len as usize);
        Ok(out)
    }

    async fn bdev_alloc(&self, target: &TargetEntry) -> Result<Vec<Extent>> {
        let res: bdev::AllocateBlocksResult = self
            .client
            .call(
                target.pool,
                0,
                bdev::methods::ALLOCATE_BLOCKS,
                bdev::AllocateBlocksTask { size: CHUNK_SIZE },
            )
            .await?;
        target.adjust_free(-(CHUNK_SIZE as i64));
        Ok(res.extents)
    }

    async fn bdev_free(&self, target: &TargetEntry, extents: Vec<Extent>) -> Result<()> {
        let freed: u64 = extents.iter().map(|e| e.len).sum();
        let _res: bdev::FreeBlocksResult = self
            .client
            .call(
                target.pool,
                0,
                bdev::methods::FREE_BLOCKS,
                bdev::FreeBlocksTask { extents },
            )
            .await?;
        target.adjust_free(freed as i64);
        Ok(())
    }

    /// Allocate a chunk somewhere compatible, evicting colder blobs from
    /// the preferred target when it is full.
    async fn place_chunk(
        self: &Arc<Self>,
        policy: Option<BdevType>,
        protect: &(String, String),
    ) -> Result<(Arc<TargetEntry>, Vec<Extent>)> {
        loop {
            let candidates = self.target_candidates();
            let filtered: Vec<PlacementCandidate> = match policy {
                Some(kind) => candidates.into_iter().filter(|c| c.kind == kind).collect(),
                None => candidates,
            };
            let Some(index) = placement::choose_target(&filtered, None, CHUNK_SIZE) else {
                // Nothing has room; try to make room on a compatible target.
                let Some(fallback) = filtered.first().map(|c| c.index) else {
                    return Err(RuntimeError::TargetFull("no compatible targets".into()));
                };
                let target = self
                    .target_at(fallback)
                    .ok_or_else(|| RuntimeError::TargetFull("target disappeared".into()))?;
                if !self.try_evict(&target, protect).await? {
                    return Err(RuntimeError::TargetFull(target.name.clone()));
                }
                continue;
            };
            let target = self
                .target_at(index)
                .ok_or_else(|| RuntimeError::TargetFull("target disappeared".into()))?;
            match self.bdev_alloc(&target).await {
                Ok(extents) => return Ok((target, extents)),
                Err(RuntimeError::TargetFull(_)) => {
                    if !self.try_evict(&target, protect).await? {
                        return Err(RuntimeError::TargetFull(target.name.clone()));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Evict the coldest blob from `target`. Returns false when no victim
    /// could be moved or dropped.
    async fn try_evict(
        self: &Arc<Self>,
        target: &Arc<TargetEntry>,
        protect: &(String, String),
    ) -> Result<bool> {
        let keys: Vec<(String, String)> = target
            .resident
            .read()
            .unwrap()
            .iter()
            .filter(|key| *key != protect)
            .cloned()
            .collect();
        let mut candidates = Vec::new();
        for (tag_name, blob_name) in &keys {
            let Ok(tag) = self.tag(tag_name) else { continue };
            let Ok(blob) = self.blob(&tag, blob_name) else {
                continue;
            };
            let meta = blob.meta.lock().unwrap();
            if !meta.resident {
                continue;
            }
            candidates.push(EvictionCandidate {
                tag: tag_name.clone(),
                blob: blob_name.clone(),
                score: meta.score,
                last_access: meta.last_access.unwrap_or_else(Instant::now),
                size: meta.size,
            });
        }
        let Some(victim) = placement::choose_victim(&candidates).cloned() else {
            return Ok(false);
        };
        let tag = self.tag(&victim.tag)?;
        let blob = self.blob(&tag, &victim.blob)?;
        // A victim under an active put would deadlock against our own blob
        // lock; skip it rather than wait.
        let Some(_guard) = blob.lock.try_lock() else {
            return Ok(false);
        };
        match self.evict_locked(&tag, &blob).await {
            Ok(()) => {
                tracing::debug!(tag = %victim.tag, blob = %victim.blob, target = %target.name, "blob evicted");
                Ok(true)
            }
            // Eviction without a spill destination is not forced; the
            // original allocation failure surfaces instead.
            Err(RuntimeError::TargetFull(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Spill a blob's chunks to a persistent target (or reuse an existing
    /// backing copy) and release its fast placement.
    async fn evict_locked(self: &Arc<Self>, tag: &TagEntry, blob: &BlobEntry) -> Result<()> {
        let (chunks, has_backing) = {
            let meta = blob.meta.lock().unwrap();
            (
                meta.chunks
                    .iter()
                    .map(|c| {
                        (
                            c.index,
                            Arc::clone(&c.target),
                            c.extents.clone(),
                            c.valid,
                            c.stored,
                            c.digest,
                        )
                    })
                    .collect::<Vec<_>>(),
                !meta.backing.is_empty(),
            )
        };

        let mut backing = Vec::new();
        if !has_backing {
            // Prefer a persistent class for the spill copy.
            let spill = {
                let targets = self.targets.read().unwrap();
                targets
                    .iter()
                    .filter(|t| matches!(t.kind, BdevType::File | BdevType::Nvme))
                    .filter(|t| t.free_bytes() >= CHUNK_SIZE * chunks.len() as u64)
                    .max_by_key(|t| t.free_bytes())
                    .cloned()
            };
            let Some(spill) = spill else {
                return Err(RuntimeError::TargetFull(
                    "no spill target for eviction".into(),
                ));
            };
            for (index, target, extents, valid, stored, digest) in &chunks {
                let data = self.bdev_read(target, extents, *stored).await?;
                let new_extents = self.bdev_alloc(&spill).await?;
                self.bdev_write(&spill, &new_extents, &data).await?;
                backing.push(ChunkRef {
                    index: *index,
                    target: Arc::clone(&spill),
                    extents: new_extents,
                    valid: *valid,
                    stored: *stored,
                    digest: *digest,
                });
            }
            spill
                .resident
                .write()
                .unwrap()
                .insert((tag.name.clone(), blob.name.clone()));
        }

        // Release the fast placement.
        for (_, target, extents, _, _, _) in chunks {
            self.bdev_free(&target, extents).await?;
            target
                .resident
                .write()
                .unwrap()
                .remove(&(tag.name.clone(), blob.name.clone()));
        }
        let mut meta = blob.meta.lock().unwrap();
        meta.chunks.clear();
        if !backing.is_empty() {
            meta.backing = backing;
        }
        meta.resident = false;
        Ok(())
    }

    /// Restore an evicted blob from its backing copies onto the best
    /// targets for its score. Caller holds the blob lock.
    async fn rematerialize_locked(
        self: &Arc<Self>,
        tag: &TagEntry,
        blob: &BlobEntry,
    ) -> Result<()> {
        let backing_view = {
            let meta = blob.meta.lock().unwrap();
            if meta.resident {
                return Ok(());
            }
            if meta.backing.is_empty() {
                return Err(RuntimeError::BlobNotFound(format!(
                    "{}/{} was evicted without a backing copy",
                    tag.name, blob.name
                )));
            }
            meta.backing
                .iter()
                .map(|c| {
                    (
                        c.index,
                        Arc::clone(&c.target),
                        c.extents.clone(),
                        c.valid,
                        c.stored,
                        c.digest,
                    )
                })
                .collect::<Vec<_>>()
        };

        let key = (tag.name.clone(), blob.name.clone());
        let mut restored = Vec::new();
        for (index, backing_target, extents, valid, stored, digest) in backing_view {
            let data = self.bdev_read(&backing_target, &extents, stored).await?;
            if blake3::hash(&data).as_bytes() != &digest {
                return Err(RuntimeError::Io {
                    errno: 0,
                    msg: format!(
                        "chunk {index} of {}/{} failed digest verification",
                        tag.name, blob.name
                    ),
                });
            }
            let (target, new_extents) = self.place_chunk(tag.policy, &key).await?;
            self.bdev_write(&target, &new_extents, &data).await?;
            target.resident.write().unwrap().insert(key.clone());
            restored.push(ChunkRef {
                index,
                target,
                extents: new_extents,
                valid,
                stored,
                digest,
            });
        }
        let mut meta = blob.meta.lock().unwrap();
        meta.chunks = restored;
        meta.resident = true;
        Ok(())
    }

    // --- the data plane -----------------------------------------------------

    /// Write `data` at `off`. Partial writes patch overlapping chunks; the
    /// union of serialized writes is the final content.
    pub async fn put_blob(
        self: Arc<Self>,
        tag_name: String,
        blob_name: String,
        off: u64,
        data: Vec<u8>,
        score: f32,
    ) -> Result<u64> {
        let tag = self.tag(&tag_name)?;
        let blob = self.blob_or_create(&tag, &blob_name);
        let _guard = blob.lock.lock().await;

        if data.is_empty() {
            // A zero-length put is a successful no-op.
            return Ok(0);
        }

        let needs_remat = {
            let meta = blob.meta.lock().unwrap();
            !meta.resident && !meta.backing.is_empty()
        };
        if needs_remat {
            self.rematerialize_locked(&tag, &blob).await?;
        }

        let key = (tag.name.clone(), blob.name.clone());

        // Spill copies go stale the moment the content changes.
        let stale: Vec<(Arc<TargetEntry>, Vec<Extent>)> = {
            let mut meta = blob.meta.lock().unwrap();
            meta.backing
                .drain(..)
                .map(|c| (c.target, c.extents))
                .collect()
        };
        for (target, extents) in stale {
            self.bdev_free(&target, extents).await?;
            let still_used = {
                let meta = blob.meta.lock().unwrap();
                meta.chunks.iter().any(|c| c.target.name == target.name)
            };
            if !still_used {
                target.resident.write().unwrap().remove(&key);
            }
        }

        let end = off + data.len() as u64;
        let first_chunk = off / CHUNK_SIZE;
        let last_chunk = (end - 1) / CHUNK_SIZE;

        for chunk_index in first_chunk..=last_chunk {
            let chunk_start = chunk_index * CHUNK_SIZE;
            let patch_from = off.max(chunk_start);
            let patch_to = end.min(chunk_start + CHUNK_SIZE);

            // Assemble the chunk's new logical content.
            let existing = {
                let meta = blob.meta.lock().unwrap();
                meta.chunks
                    .iter()
                    .find(|c| c.index == chunk_index)
                    .map(|c| (Arc::clone(&c.target), c.extents.clone(), c.valid, c.stored))
            };
            let mut content = match &existing {
                Some((target, extents, valid, stored)) => {
                    let raw = self.bdev_read(target, extents, *stored).await?;
                    let mut plain = Vec::new();
                    self.compressor.decompress(&raw, &mut plain)?;
                    plain.truncate(*valid as usize);
                    plain
                }
                None => Vec::new(),
            };
            let needed = (patch_to - chunk_start) as usize;
            if content.len() < needed {
                content.resize(needed, 0);
            }
            let src_from = (patch_from - off) as usize;
            let src_to = (patch_to - off) as usize;
            content[(patch_from - chunk_start) as usize..needed]
                .copy_from_slice(&data[src_from..src_to]);

            let mut stored_bytes = Vec::new();
            self.compressor.compress(&content, &mut stored_bytes)?;
            let digest = *blake3::hash(&stored_bytes).as_bytes();

            let (target, extents) = match existing {
                Some((target, extents, _, _)) => (target, extents),
                None => {
                    let placed = self.place_chunk(tag.policy, &key).await?;
                    placed.0.resident.write().unwrap().insert(key.clone());
                    placed
                }
            };
            self.bdev_write(&target, &extents, &stored_bytes).await?;

            let mut meta = blob.meta.lock().unwrap();
            let chunk = ChunkRef {
                index: chunk_index,
                target,
                extents,
                valid: content.len() as u64,
                stored: stored_bytes.len() as u64,
                digest,
            };
            match meta.chunks.iter_mut().find(|c| c.index == chunk_index) {
                Some(slot) => *slot = chunk,
                None => {
                    meta.chunks.push(chunk);
                    meta.chunks.sort_unstable_by_key(|c| c.index);
                }
            }
        }

        let mut meta = blob.meta.lock().unwrap();
        meta.size = meta.size.max(end);
        meta.score = score.clamp(0.0, 1.0);
        meta.resident = true;
        meta.last_access = Some(Instant::now());
        Ok(data.len() as u64)
    }

    /// Read `len` bytes at `off` (`len == 0` reads to the end of the blob).
    pub async fn get_blob(
        self: Arc<Self>,
        tag_name: String,
        blob_name: String,
        off: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let tag = self.tag(&tag_name)?;
        let blob = self.blob(&tag, &blob_name)?;
        let _guard = blob.lock.lock().await;

        let needs_remat = {
            let meta = blob.meta.lock().unwrap();
            !meta.resident
        };
        if needs_remat {
            self.rematerialize_locked(&tag, &blob).await?;
        }

        let (size, chunk_view) = {
            let mut meta = blob.meta.lock().unwrap();
            meta.last_access = Some(Instant::now());
            (
                meta.size,
                meta.chunks
                    .iter()
                    .map(|c| (c.index, Arc::clone(&c.target), c.extents.clone(), c.valid, c.stored))
                    .collect::<Vec<_>>(),
            )
        };
        if off >= size {
            return Ok(Vec::new());
        }
        let len = if len == 0 { size - off } else { len.min(size - off) };
        let end = off + len;

        let mut out = vec![0u8; len as usize];
        for (index, target, extents, valid, stored) in chunk_view {
            let chunk_start = index * CHUNK_SIZE;
            let chunk_end = chunk_start + valid;
            if chunk_end <= off || chunk_start >= end {
                continue;
            }
            let raw = self.bdev_read(&target, &extents, stored).await?;
            let mut plain = Vec::new();
            self.compressor.decompress(&raw, &mut plain)?;
            plain.truncate(valid as usize);

            let copy_from = off.max(chunk_start);
            let copy_to = end.min(chunk_end);
            out[(copy_from - off) as usize..(copy_to - off) as usize].copy_from_slice(
                &plain[(copy_from - chunk_start) as usize..(copy_to - chunk_start) as usize],
            );
        }
        Ok(out)
    }

    pub async fn del_blob(self: Arc<Self>, tag_name: String, blob_name: String) -> Result<()> {
        let tag = self.tag(&tag_name)?;
        let blob = self.blob(&tag, &blob_name)?;
        let _guard = blob.lock.lock().await;

        let key = (tag.name.clone(), blob.name.clone());
        let all: Vec<(Arc<TargetEntry>, Vec<Extent>)> = {
            let mut meta = blob.meta.lock().unwrap();
            meta.resident = false;
            let drained_chunks: Vec<_> = meta.chunks.drain(..).collect();
            let drained_backing: Vec<_> = meta.backing.drain(..).collect();
            drained_chunks
                .into_iter()
                .chain(drained_backing)
                .map(|c| (c.target, c.extents))
                .collect()
        };
        for (target, extents) in all {
            self.bdev_free(&target, extents).await?;
            target.resident.write().unwrap().remove(&key);
        }
        tag.blobs.write().unwrap().remove(&blob_name);
        Ok(())
    }

    pub async fn del_tag(self: Arc<Self>, tag_name: String) -> Result<()> {
        let tag = self.tag(&tag_name)?;
        let blob_names: Vec<String> = tag.blobs.read().unwrap().keys().cloned().collect();
        for blob_name in blob_names {
            Arc::clone(&self).del_blob(tag_name.clone(), blob_name).await?;
        }
        self.tags.write().unwrap().remove(&tag_name);
        self.by_id.write().unwrap().remove(&tag.id);
        Ok(())
    }

    /// Re-score a blob and migrate its chunks toward the device class the
    /// new score maps onto.
    pub async fn reorganize_blob(
        self: Arc<Self>,
        tag_name: String,
        blob_name: String,
        score: f32,
    ) -> Result<()> {
        let tag = self.tag(&tag_name)?;
        let blob = self.blob(&tag, &blob_name)?;
        let _guard = blob.lock.lock().await;

        let score = score.clamp(0.0, 1.0);
        {
            let meta = blob.meta.lock().unwrap();
            if !meta.resident {
                // Score still drives the next rematerialization placement.
                drop(meta);
                blob.meta.lock().unwrap().score = score;
                return Ok(());
            }
        }

        let desired = placement::desired_kinds(score);
        let key = (tag.name.clone(), blob.name.clone());
        let chunk_view = {
            let meta = blob.meta.lock().unwrap();
            meta.chunks
                .iter()
                .map(|c| (c.index, Arc::clone(&c.target), c.extents.clone(), c.valid, c.stored, c.digest))
                .collect::<Vec<_>>()
        };

        for (index, current, extents, valid, stored, digest) in chunk_view {
            // Find the best desired class with an available target.
            let destination = {
                let targets = self.targets.read().unwrap();
                desired.iter().find_map(|kind| {
                    targets
                        .iter()
                        .filter(|t| t.kind == *kind && t.free_bytes() >= CHUNK_SIZE)
                        .max_by_key(|t| t.free_bytes())
                        .cloned()
                })
            };
            let Some(destination) = destination else { break };
            if destination.name == current.name {
                continue;
            }
            let data = self.bdev_read(&current, &extents, stored).await?;
            let new_extents = self.bdev_alloc(&destination).await?;
            self.bdev_write(&destination, &new_extents, &data).await?;
            self.bdev_free(&current, extents).await?;
            destination.resident.write().unwrap().insert(key.clone());

            let mut meta = blob.meta.lock().unwrap();
            if let Some(slot) = meta.chunks.iter_mut().find(|c| c.index == index) {
                *slot = ChunkRef {
                    index,
                    target: Arc::clone(&destination),
                    extents: new_extents,
                    valid,
                    stored,
                    digest,
                };
            }
            let still_used = meta.chunks.iter().any(|c| c.target.name == current.name)
                || meta.backing.iter().any(|c| c.target.name == current.name);
            if !still_used {
                current.resident.write().unwrap().remove(&key);
            }
        }

        blob.meta.lock().unwrap().score = score;
        Ok(())
    }
}
