//! Runtime configuration: defaults, environment overrides, YAML overlay.
//!
//! Configuration is resolved in three layers: compiled defaults, an optional
//! YAML file, and environment variables (highest precedence). The segment
//! name is the only setting clients must agree on with the server.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable selecting the shared segment name.
pub const ENV_SEGMENT: &str = "CONTEXT_SEGMENT";
/// Environment variable overriding the worker count.
pub const ENV_WORKERS: &str = "CONTEXT_WORKERS";
/// When set to `1`, `runtime_init(Client)` also hosts an integrated server.
pub const ENV_WITH_RUNTIME: &str = "CHIMAERA_WITH_RUNTIME";
/// Test hook: force client-side runtime initialization.
pub const ENV_INIT_RUNTIME: &str = "INIT_CHIMAERA";

/// Default shared segment name (a file under `/dev/shm`).
pub const DEFAULT_SEGMENT: &str = "/chimaera_main_segment";

/// Root runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Shared segment name. Leading `/` maps to `/dev/shm/<name>`.
    pub segment_name: String,
    /// Total size of the shared segment in bytes.
    pub segment_size: u64,
    /// Number of scheduler worker threads.
    pub num_workers: usize,
    /// Ingress lanes allocated per container.
    pub lanes_per_container: u32,
    /// Capacity of each lane ring (power of two).
    pub lane_depth: u32,
    /// Capacity of the future-record slab.
    pub future_slots: u32,
    /// Bounded retry count before `send` surfaces queue-full.
    pub send_retries: u32,
    /// Initial worker suspend period in microseconds.
    pub suspend_period_us: u64,
    /// Upper bound for the adaptive suspend period.
    pub suspend_period_cap_us: u64,
    /// Idle iterations before the suspend period doubles.
    pub idle_threshold: u64,
    /// Batch of future handles drained from a lane per visit.
    pub lane_batch: u32,
    /// Node id of this runtime within the cluster address table.
    pub node_id: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            segment_name: DEFAULT_SEGMENT.to_string(),
            segment_size: 64 * 1024 * 1024,
            num_workers: 4,
            lanes_per_container: 4,
            lane_depth: 1024,
            future_slots: 8192,
            send_retries: 64,
            suspend_period_us: 50,
            suspend_period_cap_us: 10_000,
            idle_threshold: 16,
            lane_batch: 16,
            node_id: 0,
        }
    }
}

impl RuntimeConfig {
    /// Compiled defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a YAML config file, then apply environment overrides on top.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var(ENV_SEGMENT) {
            if !name.is_empty() {
                self.segment_name = name;
            }
        }
        if let Ok(workers) = std::env::var(ENV_WORKERS) {
            if let Ok(n) = workers.parse::<usize>() {
                if n > 0 {
                    self.num_workers = n;
                }
            }
        }
    }

    /// Whether `runtime_init(Client)` should bring up the integrated server.
    pub fn integrated_runtime() -> bool {
        matches!(std::env::var(ENV_WITH_RUNTIME).as_deref(), Ok("1"))
            || matches!(std::env::var(ENV_INIT_RUNTIME).as_deref(), Ok("1"))
    }

    /// Filesystem path backing the named segment.
    pub fn segment_path(&self) -> std::path::PathBuf {
        let name = self.segment_name.trim_start_matches('/');
        if cfg!(target_os = "linux") {
            Path::new("/dev/shm").join(name)
        } else {
            std::env::temp_dir().join(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.segment_name, DEFAULT_SEGMENT);
        assert!(config.lane_depth.is_power_of_two());
        assert!(config.num_workers > 0);
    }

    #[test]
    fn yaml_overlay_keeps_unset_fields() {
        let config: RuntimeConfig = serde_yaml::from_str("num_workers: 2\n").unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.lane_depth, RuntimeConfig::default().lane_depth);
    }
}
