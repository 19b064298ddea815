//! Threaded backend over the tokio blocking pool, the host's best
//! available async-file facility for portable builds.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

use super::table::FileTable;
use super::{AsyncIo, IoBuf, IoHandle, IoOpenOptions, IoResult, IoToken};

pub struct ThreadedIo {
    table: FileTable,
    runtime: Arc<tokio::runtime::Runtime>,
    inflight: Mutex<HashMap<IoToken, tokio::task::JoinHandle<IoResult>>>,
    next_token: AtomicU64,
}

impl ThreadedIo {
    pub fn new(runtime: Arc<tokio::runtime::Runtime>) -> Self {
        Self {
            table: FileTable::default(),
            runtime,
            inflight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    fn dispatch<F>(&self, op: F) -> IoToken
    where
        F: FnOnce() -> IoResult + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let join = {
            let _guard = self.runtime.enter();
            tokio::task::spawn_blocking(op)
        };
        self.inflight.lock().unwrap().insert(token, join);
        token
    }
}

impl AsyncIo for ThreadedIo {
    fn open(&self, path: &Path, opts: IoOpenOptions) -> Result<IoHandle> {
        self.table.open(path, opts)
    }

    fn close(&self, handle: IoHandle) -> Result<()> {
        self.table.close(handle)
    }

    fn truncate(&self, handle: IoHandle, len: u64) -> Result<()> {
        self.table.truncate(handle, len)
    }

    fn read(&self, handle: IoHandle, len: u64, off: u64) -> Result<IoToken> {
        let entry = self.table.get(handle)?;
        Ok(self.dispatch(move || entry.do_read(len, off)))
    }

    fn write(&self, handle: IoHandle, buf: IoBuf, off: u64) -> Result<IoToken> {
        let entry = self.table.get(handle)?;
        Ok(self.dispatch(move || entry.do_write(&buf, off)))
    }

    fn is_complete(&self, token: IoToken) -> Option<IoResult> {
        let mut inflight = self.inflight.lock().unwrap();
        let finished = inflight.get(&token).map(|j| j.is_finished()).unwrap_or(false);
        if !finished {
            return None;
        }
        let join = inflight.remove(&token)?;
        drop(inflight);
        match futures::executor::block_on(join) {
            Ok(result) => Some(result),
            Err(_) => Some(IoResult {
                bytes: 0,
                data: None,
                errno: libc::EIO,
            }),
        }
    }
}
