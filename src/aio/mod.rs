//! Uniform async file I/O over the host's best available facility.
//!
//! Operations return an [`IoToken`] that callers poll with `is_complete`.
//! Two backends ship: [`SyncIo`], an immediate-completion fallback, and
//! [`ThreadedIo`], which dispatches to the tokio blocking pool. Targets
//! opened `direct` keep two descriptors; each op routes to the `O_DIRECT`
//! one only when buffer, offset, and length are all block-aligned, and
//! silently falls back to the buffered descriptor otherwise.

mod buf;
mod sync;
mod table;
mod threaded;

pub use buf::AlignedBuf;
pub use sync::SyncIo;
pub use threaded::ThreadedIo;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Logical block size governing the `O_DIRECT` eligibility check.
pub const DIRECT_ALIGN: usize = 4096;

/// Completion token for an in-flight operation.
pub type IoToken = u64;

/// Handle to an open file within one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub u64);

/// Completion record for a finished operation.
#[derive(Debug)]
pub struct IoResult {
    /// Bytes transferred.
    pub bytes: u64,
    /// Data for reads; `None` for writes.
    pub data: Option<Vec<u8>>,
    /// OS errno, 0 on success.
    pub errno: i32,
}

impl IoResult {
    pub fn ok(&self) -> bool {
        self.errno == 0
    }
}

/// Open options understood by every backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoOpenOptions {
    pub create: bool,
    pub truncate: bool,
    /// Request an `O_DIRECT` descriptor alongside the buffered one.
    pub direct: bool,
}

/// A write payload; alignment decides the descriptor routing.
pub enum IoBuf {
    Plain(Vec<u8>),
    Aligned(AlignedBuf),
}

impl IoBuf {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            IoBuf::Plain(vec) => vec,
            IoBuf::Aligned(buf) => buf.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Whether pointer, and length are block-aligned for `O_DIRECT`.
    pub fn direct_eligible(&self) -> bool {
        let slice = self.as_slice();
        slice.as_ptr() as usize % DIRECT_ALIGN == 0 && slice.len() % DIRECT_ALIGN == 0
    }
}

/// The uniform async-file interface.
pub trait AsyncIo: Send + Sync {
    fn open(&self, path: &Path, opts: IoOpenOptions) -> Result<IoHandle>;
    fn close(&self, handle: IoHandle) -> Result<()>;
    fn truncate(&self, handle: IoHandle, len: u64) -> Result<()>;
    /// Read `len` bytes at `off`; data arrives with the completion.
    fn read(&self, handle: IoHandle, len: u64, off: u64) -> Result<IoToken>;
    /// Write `buf` at `off`.
    fn write(&self, handle: IoHandle, buf: IoBuf, off: u64) -> Result<IoToken>;
    /// Poll a token; `Some` exactly once, when the operation finished.
    fn is_complete(&self, token: IoToken) -> Option<IoResult>;
}

/// Await a token cooperatively: the calling task yields back to its worker
/// between polls instead of blocking it.
pub async fn complete(io: &dyn AsyncIo, token: IoToken) -> IoResult {
    loop {
        if let Some(result) = io.is_complete(token) {
            return result;
        }
        crate::sched::yield_now().await;
    }
}

/// Busy-poll a token to completion (bounded spinning, then sleeps).
pub fn wait_complete(io: &dyn AsyncIo, token: IoToken) -> IoResult {
    let mut spins = 0u32;
    loop {
        if let Some(result) = io.is_complete(token) {
            return result;
        }
        if spins < 128 {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(std::time::Duration::from_micros(50));
        }
    }
}

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBackendKind {
    /// Immediate synchronous completion.
    Sync,
    /// tokio blocking-pool dispatch (default).
    Threaded,
}

/// Creates backends, sharing one tokio runtime across them.
pub struct IoFactory {
    runtime: Arc<tokio::runtime::Runtime>,
}

impl IoFactory {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ctx-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Backends usable on this host.
    pub fn available() -> Vec<IoBackendKind> {
        vec![IoBackendKind::Sync, IoBackendKind::Threaded]
    }

    pub fn create(&self, kind: IoBackendKind) -> Arc<dyn AsyncIo> {
        match kind {
            IoBackendKind::Sync => Arc::new(SyncIo::new()),
            IoBackendKind::Threaded => Arc::new(ThreadedIo::new(Arc::clone(&self.runtime))),
        }
    }

    /// The default backend for storage targets.
    pub fn default_backend(&self) -> Arc<dyn AsyncIo> {
        self.create(IoBackendKind::Threaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(io: &dyn AsyncIo, payload: IoBuf, direct: bool) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let handle = io
            .open(
                &path,
                IoOpenOptions {
                    create: true,
                    truncate: true,
                    direct,
                },
            )
            .unwrap();
        let len = payload.len() as u64;
        io.truncate(handle, len).unwrap();
        let write = io.write(handle, payload, 0).unwrap();
        let write_result = wait_complete(io, write);
        assert!(write_result.ok(), "write errno {}", write_result.errno);
        assert_eq!(write_result.bytes, len);

        let read = io.read(handle, len, 0).unwrap();
        let read_result = wait_complete(io, read);
        assert!(read_result.ok(), "read errno {}", read_result.errno);
        io.close(handle).unwrap();
        read_result.data.unwrap()
    }

    #[test]
    fn every_backend_round_trips_aligned() {
        let factory = IoFactory::new().unwrap();
        for kind in IoFactory::available() {
            let io = factory.create(kind);
            let mut buf = AlignedBuf::zeroed(DIRECT_ALIGN, DIRECT_ALIGN);
            for (i, byte) in buf.as_mut_slice().iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }
            let expect = buf.as_slice().to_vec();
            let back = round_trip(io.as_ref(), IoBuf::Aligned(buf), true);
            assert_eq!(back, expect, "backend {kind:?}");
        }
    }

    #[test]
    fn every_backend_round_trips_unaligned_via_fallback() {
        let factory = IoFactory::new().unwrap();
        for kind in IoFactory::available() {
            let io = factory.create(kind);
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
            let expect = payload.clone();
            let back = round_trip(io.as_ref(), IoBuf::Plain(payload), true);
            assert_eq!(back, expect, "backend {kind:?}");
        }
    }

    #[test]
    fn tokens_complete_exactly_once() {
        let factory = IoFactory::new().unwrap();
        let io = factory.create(IoBackendKind::Sync);
        let dir = tempfile::tempdir().unwrap();
        let handle = io
            .open(
                &dir.path().join("t.bin"),
                IoOpenOptions {
                    create: true,
                    truncate: true,
                    direct: false,
                },
            )
            .unwrap();
        let token = io.write(handle, IoBuf::Plain(vec![1, 2, 3]), 0).unwrap();
        assert!(io.is_complete(token).is_some());
        assert!(io.is_complete(token).is_none());
    }
}
