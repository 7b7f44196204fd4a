//! Pipeline configuration.
//!
//! Everything that used to be ambient process state lives in this struct
//! and is passed to the coordinator at construction.

/// Tuning knobs for one [`IndexMiner`](crate::miner::IndexMiner).
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Maximum number of extraction jobs in flight at once. Clamped to ≥ 1.
    pub pool_limit: usize,
    /// Initial throttle factor in `[0, 1]`. Zero means full speed.
    pub throttle: f64,
    /// Scheduler delay at full throttle, in milliseconds. The effective
    /// delay between dispatches is `throttle × max_tick_delay_ms`.
    pub max_tick_delay_ms: u64,
    /// Minimum interval between progress notifications, in milliseconds.
    pub progress_interval_ms: u64,
    /// How long shutdown waits for in-flight work before giving up.
    pub shutdown_grace_ms: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            pool_limit: 2,
            throttle: 0.0,
            max_tick_delay_ms: 1000,
            progress_interval_ms: 1000,
            shutdown_grace_ms: 5000,
        }
    }
}

impl MinerConfig {
    /// Clamp out-of-range values instead of failing construction.
    pub(crate) fn sanitized(mut self) -> Self {
        self.pool_limit = self.pool_limit.max(1);
        self.throttle = self.throttle.clamp(0.0, 1.0);
        self
    }
}

// ── Tests ────────────────────────────────────────────────────────────
