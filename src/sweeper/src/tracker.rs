//! Modification budget tracking.
//!
//! One tracker lives for exactly one worker pass and accounts for three
//! independent ceilings: elapsed wall time, total child rows deleted and
//! total child rows updated. The worker consults `over_limit` between
//! batches only, so a batch that has started always completes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::metrics::SweepMetrics;

const STANDARD_MAX_RUNTIME: Duration = Duration::from_secs(30);
const STANDARD_MAX_DELETES: u64 = 100_000;
const STANDARD_MAX_UPDATES: u64 = 50_000;

// Escalated ceilings: double the row budgets, 1.5x the runtime.
const TURBO_MAX_RUNTIME: Duration = Duration::from_secs(45);
const TURBO_MAX_DELETES: u64 = 200_000;
const TURBO_MAX_UPDATES: u64 = 100_000;

/// Which budget preset a pass runs under. Chosen once per invocation by an
/// external policy; the tracker itself is agnostic to the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerVariant {
    Standard,
    Turbo,
}

/// Per-pass accounting of child-table mutations against fixed ceilings.
pub struct ModificationTracker {
    max_runtime: Duration,
    max_deletes: u64,
    max_updates: u64,
    delete_count_by_table: HashMap<String, u64>,
    update_count_by_table: HashMap<String, u64>,
    started_at: Instant,
    metrics: SweepMetrics,
}

/// Snapshot of a tracker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub over_limit: bool,
    pub delete_count_by_table: HashMap<String, u64>,
    pub update_count_by_table: HashMap<String, u64>,
    pub delete_count: u64,
    pub update_count: u64,
}

impl ModificationTracker {
    pub fn new(variant: TrackerVariant, metrics: SweepMetrics) -> Self {
        match variant {
            TrackerVariant::Standard => Self::standard(metrics),
            TrackerVariant::Turbo => Self::turbo(metrics),
        }
    }

    /// Default budget for a scheduled pass.
    pub fn standard(metrics: SweepMetrics) -> Self {
        Self::with_limits(
            STANDARD_MAX_RUNTIME,
            STANDARD_MAX_DELETES,
            STANDARD_MAX_UPDATES,
            metrics,
        )
    }

    /// Escalated budget for draining a backlog.
    pub fn turbo(metrics: SweepMetrics) -> Self {
        Self::with_limits(
            TURBO_MAX_RUNTIME,
            TURBO_MAX_DELETES,
            TURBO_MAX_UPDATES,
            metrics,
        )
    }

    pub fn with_limits(
        max_runtime: Duration,
        max_deletes: u64,
        max_updates: u64,
        metrics: SweepMetrics,
    ) -> Self {
        Self {
            max_runtime,
            max_deletes,
            max_updates,
            delete_count_by_table: HashMap::new(),
            update_count_by_table: HashMap::new(),
            started_at: Instant::now(),
            metrics,
        }
    }

    /// Account for child rows deleted from `table`.
    pub fn add_deletions(&mut self, table: &str, count: u64) {
        *self
            .delete_count_by_table
            .entry(table.to_string())
            .or_insert(0) += count;
        self.metrics.record_deletions(table, count);
    }

    /// Account for child rows updated (nullified) in `table`.
    pub fn add_updates(&mut self, table: &str, count: u64) {
        *self
            .update_count_by_table
            .entry(table.to_string())
            .or_insert(0) += count;
        self.metrics.record_updates(table, count);
    }

    pub fn delete_count(&self) -> u64 {
        self.delete_count_by_table.values().sum()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count_by_table.values().sum()
    }

    /// True once any ceiling is reached. Budget exhaustion is a normal
    /// terminal state of a pass, not an error.
    pub fn over_limit(&self) -> bool {
        self.delete_count() >= self.max_deletes
            || self.update_count() >= self.max_updates
            || self.started_at.elapsed() >= self.max_runtime
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            over_limit: self.over_limit(),
            delete_count_by_table: self.delete_count_by_table.clone(),
            update_count_by_table: self.update_count_by_table.clone(),
            delete_count: self.delete_count(),
            update_count: self.update_count(),
        }
    }
}
