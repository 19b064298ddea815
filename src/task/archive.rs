//! Task payload archives.
//!
//! Remote (wire) submissions serialize typed task structs with bincode via a
//! module's `save_task`/`load_task` table. Local submissions skip
//! serialization entirely: the typed payload is parked in a process-local
//! archive keyed by the future's segment offset, and the record only carries
//! the `LOCAL_PAYLOAD` flag.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RuntimeError};

/// Input payload handed to a module's `run`/`save_task`.
pub enum TaskInput {
    /// Same-process submission; downcast to the method's task struct.
    Local(Box<dyn Any + Send + Sync>),
    /// Cross-process submission; decode with the method's `load_task`.
    Wire(Vec<u8>),
}

impl TaskInput {
    /// Downcast a local payload to the method's task struct.
    pub fn downcast<T: 'static>(self) -> Result<Box<T>> {
        match self {
            TaskInput::Local(any) => any
                .downcast::<T>()
                .map_err(|_| RuntimeError::Serde("task payload type mismatch".into())),
            TaskInput::Wire(_) => Err(RuntimeError::Serde(
                "wire payload reached a local-only path".into(),
            )),
        }
    }
}

/// Output payload published by a completed task.
pub enum TaskOutput {
    Local(Box<dyn Any + Send + Sync>),
    Wire(Vec<u8>),
}

impl TaskOutput {
    pub fn downcast<T: 'static>(self) -> Result<Box<T>> {
        match self {
            TaskOutput::Local(any) => any
                .downcast::<T>()
                .map_err(|_| RuntimeError::Serde("result payload type mismatch".into())),
            TaskOutput::Wire(_) => Err(RuntimeError::Serde(
                "wire payload reached a local-only path".into(),
            )),
        }
    }
}

/// Encode a typed task or result for the wire.
pub fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a typed task or result from the wire.
pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Default)]
struct LocalEntry {
    input: Option<Box<dyn Any + Send + Sync>>,
    output: Option<Box<dyn Any + Send + Sync>>,
}

/// Process-local payload archive for same-process submissions.
///
/// Keys are future-record offsets, which are unique for the lifetime of the
/// record (the entry is removed before the record is recycled).
#[derive(Default)]
pub struct LocalArchive {
    entries: Mutex<HashMap<u64, LocalEntry>>,
}

impl LocalArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_input(&self, off: u64, input: Box<dyn Any + Send + Sync>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(off).or_default().input = Some(input);
    }

    pub fn take_input(&self, off: u64) -> Option<Box<dyn Any + Send + Sync>> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&off).and_then(|e| e.input.take())
    }

    pub fn put_output(&self, off: u64, output: Box<dyn Any + Send + Sync>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(off).or_default().output = Some(output);
    }

    pub fn take_output(&self, off: u64) -> Option<Box<dyn Any + Send + Sync>> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&off).and_then(|e| e.output.take())
    }

    /// Drop everything parked under `off` (future reclamation).
    pub fn remove(&self, off: u64) {
        self.entries.lock().unwrap().remove(&off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Probe {
        name: String,
        len: u64,
    }

    #[test]
    fn wire_round_trip() {
        let probe = Probe {
            name: "blob_0".into(),
            len: 4096,
        };
        let bytes = to_wire(&probe).unwrap();
        let back: Probe = from_wire(&bytes).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn local_archive_moves_payloads() {
        let archive = LocalArchive::new();
        archive.put_input(7, Box::new(42u32));
        let input = archive.take_input(7).unwrap();
        assert_eq!(*input.downcast::<u32>().unwrap(), 42);
        assert!(archive.take_input(7).is_none());
        archive.remove(7);
    }
}
