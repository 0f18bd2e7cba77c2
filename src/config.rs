//! Engine configuration
//!
//! Tunables for sequence generation, assigner time budgets, retry/backoff,
//! and the completion monitor. Defaults match the production values; tests
//! override individual fields through the `with_*` builders.

use crate::cost::Proration;
use std::time::Duration;

/// Maximum eligible plans per group; `k!` sequences makes anything much
/// larger combinatorially hopeless
pub const DEFAULT_RATE_PLAN_LIMIT: usize = 15;

/// Sequences persisted per instance before a continuation is emitted
pub const DEFAULT_SEQUENCE_BATCH_LIMIT: usize = 1000;

/// Default wall-clock budget for a single assigner invocation
pub const DEFAULT_TIME_BUDGET_MS: u64 = 60_000;

/// Default completion-monitor attempt ceiling
pub const DEFAULT_MONITOR_MAX_ATTEMPTS: u32 = 10;

/// What the worker does when the checkpoint store fails mid-run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFallback {
    /// Fail the queue outright
    FailQueue,
    /// Finish synchronously in one shot if no more than this many devices remain
    FallbackIfSmall(usize),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on eligible plans per group (validation failure beyond it)
    pub rate_plan_limit: usize,

    /// Max sequences persisted for the first instance; the rest continue
    pub sequence_batch_limit: usize,

    /// Wall-clock budget per assigner invocation
    pub time_budget: Duration,

    /// Rate-term proration for partial billing windows
    pub proration: Proration,

    /// Checkpoint-store failure policy
    pub checkpoint_fallback: CheckpointFallback,

    /// Completion-monitor retry ceiling
    pub monitor_max_attempts: u32,

    /// Initial completion-monitor backoff (doubles each attempt)
    pub monitor_initial_backoff: Duration,

    /// Transient-error retry ceiling for a single work item
    pub transient_retry_limit: u32,

    /// Initial worker backoff on transient errors (doubles each attempt)
    pub transient_initial_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_plan_limit: DEFAULT_RATE_PLAN_LIMIT,
            sequence_batch_limit: DEFAULT_SEQUENCE_BATCH_LIMIT,
            time_budget: Duration::from_millis(DEFAULT_TIME_BUDGET_MS),
            proration: Proration::None,
            checkpoint_fallback: CheckpointFallback::FallbackIfSmall(500),
            monitor_max_attempts: DEFAULT_MONITOR_MAX_ATTEMPTS,
            monitor_initial_backoff: Duration::from_millis(100),
            transient_retry_limit: 5,
            transient_initial_backoff: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    /// Set the per-invocation time budget
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Set the eligible-plans cap
    pub fn with_rate_plan_limit(mut self, limit: usize) -> Self {
        self.rate_plan_limit = limit;
        self
    }

    /// Set the sequence batch limit
    pub fn with_sequence_batch_limit(mut self, limit: usize) -> Self {
        self.sequence_batch_limit = limit;
        self
    }

    /// Set proration
    pub fn with_proration(mut self, proration: Proration) -> Self {
        self.proration = proration;
        self
    }

    /// Set the checkpoint-store failure policy
    pub fn with_checkpoint_fallback(mut self, fallback: CheckpointFallback) -> Self {
        self.checkpoint_fallback = fallback;
        self
    }

    /// Set monitor retry parameters
    pub fn with_monitor_retries(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.monitor_max_attempts = max_attempts;
        self.monitor_initial_backoff = initial_backoff;
        self
    }
}
