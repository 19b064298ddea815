//! Shared fixture: one integrated runtime per test binary.

use std::sync::{Arc, OnceLock};

use context_runtime::{runtime_init, ContextClient, RuntimeConfig, RuntimeMode};

/// Workers configured for test runtimes.
pub const TEST_WORKERS: usize = 2;

/// Bring up (or reuse) this process's integrated runtime.
pub fn init_runtime() -> Arc<ContextClient> {
    static CTX: OnceLock<Arc<ContextClient>> = OnceLock::new();
    Arc::clone(CTX.get_or_init(|| {
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "test".into());
        std::env::set_var(
            context_runtime::config::ENV_SEGMENT,
            format!("/ctx_{}_{}", exe, std::process::id()),
        );
        std::env::set_var(context_runtime::config::ENV_WITH_RUNTIME, "1");

        let mut config = RuntimeConfig::from_env();
        config.num_workers = TEST_WORKERS;
        config.segment_size = 32 * 1024 * 1024;
        runtime_init(RuntimeMode::Client, config).expect("integrated runtime should start")
    }))
}
