//! Device-side submission seam.
//!
//! The enqueue protocol (future record + lane ring) is defined over plain
//! offsets and atomics so a device kernel could in principle produce into a
//! lane. Hosts without a device path use the default implementation, which
//! reports the capability as unsupported.

use crate::error::{Result, RuntimeError};
use crate::mem::Segment;

/// Submission entry point for device-resident producers.
pub trait GpuSubmit: Send + Sync {
    /// Enqueue a prepared future handle from device code.
    fn submit_from_device(&self, _seg: &Segment, _lane_off: u64, _handle: u64) -> Result<()> {
        Err(RuntimeError::Unsupported(
            "no GPU submission path on this host".into(),
        ))
    }

    /// Whether a device path is available.
    fn is_available(&self) -> bool {
        false
    }
}

/// The host-only default.
pub struct HostOnlyGpu;

impl GpuSubmit for HostOnlyGpu {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_reports_unsupported() {
        let gpu = HostOnlyGpu;
        assert!(!gpu.is_available());
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg"), 1 << 20, 8, 256).unwrap();
        assert!(matches!(
            gpu.submit_from_device(&seg, 0, 0),
            Err(RuntimeError::Unsupported(_))
        ));
    }
}
