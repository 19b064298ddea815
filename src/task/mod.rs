//! Task identifiers, routing hints, and the shared completion record.

mod archive;
mod future;

pub use archive::{from_wire, to_wire, LocalArchive, TaskInput, TaskOutput};
pub use future::{
    flags, release_ref, CompletionBoard, FutureInit, FutureRecord, FutureState, JoinFuture,
    TaskFuture, FUTURE_SLOT_SIZE,
};

use serde::{Deserialize, Serialize};

pub type TaskId = u64;
pub type WorkerId = u32;
pub type ContainerId = u32;
pub type LaneId = u32;
pub type MethodId = u32;

/// Reserved method ids shared by every module.
pub const METHOD_CREATE: MethodId = 0;
pub const METHOD_DESTROY: MethodId = 1;
pub const METHOD_MONITOR: MethodId = 9;
/// First id available to module-specific methods.
pub const FIRST_MODULE_METHOD: MethodId = 10;

/// Pool identifier: `(major, minor)`. Admin owns `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId {
    pub major: u32,
    pub minor: u32,
}

impl PoolId {
    pub const ADMIN: PoolId = PoolId { major: 0, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the CLI form `major.minor`.
    pub fn parse(text: &str) -> Option<Self> {
        let (major, minor) = text.split_once('.')?;
        Some(Self {
            major: major.trim().parse().ok()?,
            minor: minor.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Routing hint carried by every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoolQuery {
    /// Execute on the submitting node.
    #[default]
    Local,
    /// Let the runtime pick a node from the address table.
    Dynamic,
    /// Pin to a specific node id.
    Specific(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_parses_cli_form() {
        assert_eq!(PoolId::parse("200.0"), Some(PoolId::new(200, 0)));
        assert_eq!(PoolId::parse("1.2").unwrap().to_string(), "1.2");
        assert_eq!(PoolId::parse("garbage"), None);
        assert_eq!(PoolId::parse("1"), None);
    }
}
