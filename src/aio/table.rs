//! Shared open-file table and blocking positional I/O used by both
//! backends, including the direct/buffered descriptor routing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Result, RuntimeError};

use super::{AlignedBuf, IoBuf, IoHandle, IoOpenOptions, IoResult, DIRECT_ALIGN};

pub(super) struct FileEntry {
    buffered: File,
    direct: Option<File>,
}

impl FileEntry {
    fn errno(err: &std::io::Error) -> i32 {
        err.raw_os_error().unwrap_or(libc::EIO)
    }

    /// Positional read; routes to the `O_DIRECT` descriptor only when both
    /// offset and length are block-aligned.
    pub(super) fn do_read(&self, len: u64, off: u64) -> IoResult {
        let aligned =
            off as usize % DIRECT_ALIGN == 0 && len as usize % DIRECT_ALIGN == 0 && len > 0;
        let (file, mut buf) = match (&self.direct, aligned) {
            (Some(direct), true) => {
                let buf = AlignedBuf::zeroed(len as usize, DIRECT_ALIGN);
                (direct, IoBuf::Aligned(buf))
            }
            _ => (&self.buffered, IoBuf::Plain(vec![0u8; len as usize])),
        };

        let slice = match &mut buf {
            IoBuf::Plain(vec) => vec.as_mut_slice(),
            IoBuf::Aligned(aligned) => aligned.as_mut_slice(),
        };
        let mut read = 0usize;
        while read < slice.len() {
            match file.read_at(&mut slice[read..], off + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return IoResult {
                        bytes: read as u64,
                        data: None,
                        errno: Self::errno(&err),
                    }
                }
            }
        }
        let mut data = match buf {
            IoBuf::Plain(vec) => vec,
            IoBuf::Aligned(aligned) => aligned.as_slice().to_vec(),
        };
        data.truncate(read);
        IoResult {
            bytes: read as u64,
            data: Some(data),
            errno: 0,
        }
    }

    /// Positional write with the same routing rule; a misaligned buffer or
    /// offset silently takes the buffered descriptor.
    pub(super) fn do_write(&self, buf: &IoBuf, off: u64) -> IoResult {
        let aligned = off as usize % DIRECT_ALIGN == 0 && buf.direct_eligible();
        let file = match (&self.direct, aligned) {
            (Some(direct), true) => direct,
            _ => &self.buffered,
        };
        match file.write_all_at(buf.as_slice(), off) {
            Ok(()) => IoResult {
                bytes: buf.len() as u64,
                data: None,
                errno: 0,
            },
            Err(err) => IoResult {
                bytes: 0,
                data: None,
                errno: Self::errno(&err),
            },
        }
    }
}

/// Handle table shared by every operation of one backend instance.
#[derive(Default)]
pub(super) struct FileTable {
    files: RwLock<HashMap<u64, Arc<FileEntry>>>,
    next_handle: AtomicU64,
}

impl FileTable {
    pub(super) fn open(&self, path: &Path, opts: IoOpenOptions) -> Result<IoHandle> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if opts.create {
            options.create(true);
        }
        if opts.truncate {
            options.truncate(true);
        }
        let buffered = options.open(path)?;

        // Best effort: a filesystem that refuses O_DIRECT just loses the
        // direct path, not the open.
        let direct = if opts.direct {
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_DIRECT)
                .open(path)
                .ok()
        } else {
            None
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.files
            .write()
            .unwrap()
            .insert(handle, Arc::new(FileEntry { buffered, direct }));
        Ok(IoHandle(handle))
    }

    pub(super) fn get(&self, handle: IoHandle) -> Result<Arc<FileEntry>> {
        self.files
            .read()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or(RuntimeError::Io {
                errno: libc::EBADF,
                msg: "unknown io handle".into(),
            })
    }

    pub(super) fn close(&self, handle: IoHandle) -> Result<()> {
        self.files
            .write()
            .unwrap()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(RuntimeError::Io {
                errno: libc::EBADF,
                msg: "unknown io handle".into(),
            })
    }

    pub(super) fn truncate(&self, handle: IoHandle, len: u64) -> Result<()> {
        let entry = self.get(handle)?;
        entry.buffered.set_len(len)?;
        Ok(())
    }
}
