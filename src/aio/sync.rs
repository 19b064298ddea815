//! Synchronous fallback backend: operations complete inline and the token
//! is already resolved when `is_complete` is first polled.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;

use super::table::FileTable;
use super::{AsyncIo, IoBuf, IoHandle, IoOpenOptions, IoResult, IoToken};

#[derive(Default)]
pub struct SyncIo {
    table: FileTable,
    completions: Mutex<HashMap<IoToken, IoResult>>,
    next_token: AtomicU64,
}

impl SyncIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&self, result: IoResult) -> IoToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.completions.lock().unwrap().insert(token, result);
        token
    }
}

impl AsyncIo for SyncIo {
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
        Ok(self.finish(entry.do_read(len, off)))
    }

    fn write(&self, handle: IoHandle, buf: IoBuf, off: u64) -> Result<IoToken> {
        let entry = self.table.get(handle)?;
        Ok(self.finish(entry.do_write(&buf, off)))
    }

    fn is_complete(&self, token: IoToken) -> Option<IoResult> {
        self.completions.lock().unwrap().remove(&token)
    }
}
