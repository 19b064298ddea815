//! Block-device module: one container per registered target.
//!
//! A target is a ram region or a backing file (`file`/`nvme`, the latter
//! opened with an `O_DIRECT` descriptor). The module hands out extents with
//! a first-fit free-list allocator and serves positional reads and writes
//! through the async I/O backend, so `Σ used ≤ capacity` holds by
//! construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::aio::{AsyncIo, IoBuf, IoHandle, IoOpenOptions};
use crate::error::{Result, RuntimeError};
use crate::module::{AnyOut, AnyTask, Module, ModuleEnv, RunContext, TaskBody};
use crate::task::MethodId;

pub const MODULE_NAME: &str = "bdev";

/// Registered block-device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BdevType {
    Ram,
    File,
    Nvme,
}

impl BdevType {
    /// Parse the scheme of a target name like `ram::staging`.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ram" => Some(Self::Ram),
            "file" => Some(Self::File),
            "nvme" => Some(Self::Nvme),
            _ => None,
        }
    }

    /// Relative bandwidth class used by placement scoring.
    pub fn score_weight(self) -> f64 {
        match self {
            Self::Ram => 1.0,
            Self::Nvme => 0.7,
            Self::File => 0.4,
        }
    }
}

/// A contiguous allocated range on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub off: u64,
    pub len: u64,
}

pub mod methods {
    //! Method-id table for the bdev module.
    use super::*;

    crate::method_table! {
        module "bdev";
        0  => CREATE "Create" (CreateParams => CreateResult),
        1  => DESTROY "Destroy" (DestroyTask => DestroyResult),
        9  => MONITOR "Monitor" (MonitorTask => BdevStats),
        10 => ALLOCATE_BLOCKS "AllocateBlocks" (AllocateBlocksTask => AllocateBlocksResult),
        11 => FREE_BLOCKS "FreeBlocks" (FreeBlocksTask => FreeBlocksResult),
        12 => WRITE "Write" (WriteTask => WriteResult),
        13 => READ "Read" (ReadTask => ReadResult),
        14 => GET_STATS "GetStats" (MonitorTask => BdevStats),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParams {
    pub name: String,
    pub kind: BdevType,
    pub capacity: u64,
    /// Backing file for `file`/`nvme` targets; defaults to the path encoded
    /// in the target name (`file::/path`).
    pub path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BdevStats {
    pub name: String,
    pub kind: BdevType,
    pub capacity: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateBlocksTask {
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateBlocksResult {
    pub extents: Vec<Extent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeBlocksTask {
    pub extents: Vec<Extent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeBlocksResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTask {
    pub off: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTask {
    pub off: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResult {
    pub data: Vec<u8>,
}

/// First-fit extent allocator over `[0, capacity)`.
struct ExtentAllocator {
    free: Vec<Extent>,
    free_bytes: u64,
}

impl ExtentAllocator {
    fn new(capacity: u64) -> Self {
        Self {
            free: vec![Extent {
                off: 0,
                len: capacity,
            }],
            free_bytes: capacity,
        }
    }

    /// Allocate `size` bytes, splitting across free ranges if needed.
    fn allocate(&mut self, size: u64) -> Option<Vec<Extent>> {
        if size == 0 || size > self.free_bytes {
            return None;
        }
        let mut out = Vec::new();
        let mut remaining = size;
        while remaining > 0 {
            let slot = self.free.iter().position(|e| e.len > 0)?;
            let extent = &mut self.free[slot];
            let take = extent.len.min(remaining);
            out.push(Extent {
                off: extent.off,
                len: take,
            });
            extent.off += take;
            extent.len -= take;
            remaining -= take;
            if self.free[slot].len == 0 {
                self.free.remove(slot);
            }
        }
        self.free_bytes -= size;
        Some(out)
    }

    /// Return extents to the free list, merging neighbors.
    fn free_extents(&mut self, extents: &[Extent]) {
        for extent in extents {
            if extent.len == 0 {
                continue;
            }
            self.free_bytes += extent.len;
            let at = self
                .free
                .partition_point(|e| e.off < extent.off);
            self.free.insert(at, *extent);
            // Merge with right neighbor, then left.
            if at + 1 < self.free.len()
                && self.free[at].off + self.free[at].len == self.free[at + 1].off
            {
                self.free[at].len += self.free[at + 1].len;
                self.free.remove(at + 1);
            }
            if at > 0 && self.free[at - 1].off + self.free[at - 1].len == self.free[at].off {
                self.free[at - 1].len += self.free[at].len;
                self.free.remove(at);
            }
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free_bytes
    }
}

enum Storage {
    Ram(Mutex<Vec<u8>>),
    Backed {
        io: Arc<dyn AsyncIo>,
        handle: IoHandle,
    },
}

/// Target state shared with in-flight task bodies.
struct BdevInner {
    name: String,
    kind: BdevType,
    capacity: u64,
    free_hint: AtomicU64,
    alloc: Mutex<ExtentAllocator>,
    storage: Storage,
}

/// Container-side module instance for one target.
pub struct BdevModule {
    inner: Arc<BdevInner>,
}

impl BdevModule {
    /// Module factory registered under [`MODULE_NAME`].
    pub fn factory(env: &ModuleEnv, pool_name: &str, params: &[u8]) -> Result<Arc<dyn Module>> {
        let params: CreateParams = crate::task::from_wire(params)?;
        let storage = match params.kind {
            BdevType::Ram => Storage::Ram(Mutex::new(Vec::new())),
            BdevType::File | BdevType::Nvme => {
                let path = params
                    .path
                    .clone()
                    .or_else(|| {
                        params
                            .name
                            .split_once("::")
                            .map(|(_, p)| std::path::PathBuf::from(p))
                    })
                    .ok_or_else(|| {
                        RuntimeError::ManifestInvalid(format!(
                            "target '{}' needs a backing path",
                            params.name
                        ))
                    })?;
                let io = env.io.default_backend();
                let handle = io.open(
                    &path,
                    IoOpenOptions {
                        create: true,
                        truncate: false,
                        direct: matches!(params.kind, BdevType::Nvme),
                    },
                )?;
                io.truncate(handle, params.capacity)?;
                Storage::Backed { io, handle }
            }
        };
        tracing::info!(
            target = %params.name,
            pool = pool_name,
            kind = ?params.kind,
            capacity = params.capacity,
            "block device registered"
        );
        Ok(Arc::new(Self {
            inner: Arc::new(BdevInner {
                name: params.name.clone(),
                kind: params.kind,
                capacity: params.capacity,
                free_hint: AtomicU64::new(params.capacity),
                alloc: Mutex::new(ExtentAllocator::new(params.capacity)),
                storage,
            }),
        }))
    }
}

impl BdevInner {
    fn stats(&self) -> BdevStats {
        BdevStats {
            name: self.name.clone(),
            kind: self.kind,
            capacity: self.capacity,
            free: self.free_hint.load(Ordering::Acquire),
        }
    }

    fn allocate(&self, size: u64) -> Result<Vec<Extent>> {
        let mut alloc = self.alloc.lock().unwrap();
        let extents = alloc
            .allocate(size)
            .ok_or_else(|| RuntimeError::TargetFull(self.name.clone()))?;
        self.free_hint.store(alloc.free_bytes(), Ordering::Release);
        Ok(extents)
    }

    fn free(&self, extents: &[Extent]) {
        let mut alloc = self.alloc.lock().unwrap();
        alloc.free_extents(extents);
        self.free_hint.store(alloc.free_bytes(), Ordering::Release);
    }

    async fn write(self: Arc<Self>, task: WriteTask) -> Result<WriteResult> {
        if task.off + task.data.len() as u64 > self.capacity {
            return Err(RuntimeError::TargetFull(self.name.clone()));
        }
        let bytes = task.data.len() as u64;
        match &self.storage {
            Storage::Ram(cells) => {
                let mut cells = cells.lock().unwrap();
                let end = (task.off + bytes) as usize;
                if cells.len() < end {
                    cells.resize(end, 0);
                }
                cells[task.off as usize..end].copy_from_slice(&task.data);
            }
            Storage::Backed { io, handle } => {
                let token = io.write(*handle, IoBuf::Plain(task.data), task.off)?;
                let result = crate::aio::complete(io.as_ref(), token).await;
                if !result.ok() {
                    return Err(RuntimeError::Io {
                        errno: result.errno,
                        msg: format!("write to target '{}' failed", self.name),
                    });
                }
            }
        }
        Ok(WriteResult { bytes })
    }

    async fn read(self: Arc<Self>, task: ReadTask) -> Result<ReadResult> {
        match &self.storage {
            Storage::Ram(cells) => {
                let cells = cells.lock().unwrap();
                let mut data = vec![0u8; task.len as usize];
                let start = (task.off as usize).min(cells.len());
                let end = ((task.off + task.len) as usize).min(cells.len());
                if end > start {
                    data[..end - start].copy_from_slice(&cells[start..end]);
                }
                Ok(ReadResult { data })
            }
            Storage::Backed { io, handle } => {
                let token = io.read(*handle, task.len, task.off)?;
                let result = crate::aio::complete(io.as_ref(), token).await;
                if !result.ok() {
                    return Err(RuntimeError::Io {
                        errno: result.errno,
                        msg: format!("read from target '{}' failed", self.name),
                    });
                }
                let mut data = result.data.unwrap_or_default();
                // Short reads past EOF come back zero-filled.
                data.resize(task.len as usize, 0);
                Ok(ReadResult { data })
            }
        }
    }
}

impl Module for BdevModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn method_name(&self, method: MethodId) -> Option<&'static str> {
        methods::method_name(method)
    }

    fn run(&self, method: MethodId, task: AnyTask, _ctx: RunContext) -> Result<TaskBody> {
        match method {
            methods::CREATE => {
                // State was built by the factory; creation acks here.
                Ok(Box::pin(async move { Ok(Box::new(CreateResult {}) as AnyOut) }))
            }
            methods::DESTROY => Ok(Box::pin(async move {
                Ok(Box::new(DestroyResult {}) as AnyOut)
            })),
            methods::MONITOR | methods::GET_STATS => {
                let stats = self.inner.stats();
                Ok(Box::pin(async move { Ok(Box::new(stats) as AnyOut) }))
            }
            methods::ALLOCATE_BLOCKS => {
                let task = task
                    .downcast::<AllocateBlocksTask>()
                    .map_err(|_| RuntimeError::Serde("bdev task payload mismatch".into()))?;
                let extents = self.inner.allocate(task.size);
                Ok(Box::pin(async move {
                    extents.map(|extents| Box::new(AllocateBlocksResult { extents }) as AnyOut)
                }))
            }
            methods::FREE_BLOCKS => {
                let task = task
                    .downcast::<FreeBlocksTask>()
                    .map_err(|_| RuntimeError::Serde("bdev task payload mismatch".into()))?;
                self.inner.free(&task.extents);
                Ok(Box::pin(async move {
                    Ok(Box::new(FreeBlocksResult {}) as AnyOut)
                }))
            }
            methods::WRITE => {
                let task = task
                    .downcast::<WriteTask>()
                    .map_err(|_| RuntimeError::Serde("bdev task payload mismatch".into()))?;
                let inner = Arc::clone(&self.inner);
                Ok(Box::pin(async move {
                    inner.write(*task).await.map(|r| Box::new(r) as AnyOut)
                }))
            }
            methods::READ => {
                let task = task
                    .downcast::<ReadTask>()
                    .map_err(|_| RuntimeError::Serde("bdev task payload mismatch".into()))?;
                let inner = Arc::clone(&self.inner);
                Ok(Box::pin(async move {
                    inner.read(*task).await.map(|r| Box::new(r) as AnyOut)
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
    fn allocator_first_fit_and_merge() {
        let mut alloc = ExtentAllocator::new(1000);
        let a = alloc.allocate(300).unwrap();
        let b = alloc.allocate(300).unwrap();
        assert_eq!(alloc.free_bytes(), 400);
        alloc.free_extents(&a);
        alloc.free_extents(&b);
        assert_eq!(alloc.free_bytes(), 1000);
        // Freed neighbors merged back into one range.
        assert_eq!(alloc.free.len(), 1);
        assert_eq!(alloc.free[0], Extent { off: 0, len: 1000 });
    }

    #[test]
    fn allocator_splits_across_fragments() {
        let mut alloc = ExtentAllocator::new(100);
        let a = alloc.allocate(40).unwrap();
        let _b = alloc.allocate(20).unwrap();
        alloc.free_extents(&a);
        // 40 free at the front, 40 at the back; a 60-byte request spans.
        let c = alloc.allocate(60).unwrap();
        assert!(c.len() >= 2);
        assert_eq!(c.iter().map(|e| e.len).sum::<u64>(), 60);
        assert_eq!(alloc.free_bytes(), 20);
    }

    #[test]
    fn allocator_rejects_oversubscription() {
        let mut alloc = ExtentAllocator::new(64);
        assert!(alloc.allocate(65).is_none());
        assert!(alloc.allocate(64).is_some());
        assert!(alloc.allocate(1).is_none());
    }
}
