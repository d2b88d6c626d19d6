//! Runtime configuration read from the environment

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;

/// Normalisation epsilon. Fixed by the network the weights were trained with.
pub const SKIP_LAYER_NORM_EPSILON: f32 = 1e-5;

/// Default row count at which the host kernels fan out across the rayon pool.
pub const DEFAULT_PARALLEL_MIN_ROWS: usize = 64;

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Knobs that affect scheduling and lifecycle strictness, never numerics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Row count at or above which rows are processed in parallel.
    pub parallel_min_rows: usize,
    /// Reject `initialize` on an operator that was never configured.
    pub strict: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { parallel_min_rows: DEFAULT_PARALLEL_MIN_ROWS, strict: false }
    }
}

impl RuntimeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let parallel_min_rows = env::var("SKIPLN_PARALLEL_MIN_ROWS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_PARALLEL_MIN_ROWS);
        let strict = env::var("SKIPLN_STRICT")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Self { parallel_min_rows, strict }
    }

    /// Process-wide snapshot, taken from the environment on first use.
    pub fn global() -> &'static RuntimeConfig {
        RUNTIME_CONFIG.get_or_init(Self::from_env)
    }

    pub fn with_parallel_min_rows(mut self, rows: usize) -> Self {
        self.parallel_min_rows = rows.max(1);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Whether a kernel over `rows` rows should use the thread pool.
    pub fn use_parallel(&self, rows: usize) -> bool {
        rows >= self.parallel_min_rows
    }
}
