//! Sweep metrics
//!
//! Thread-safe, in-process counters for monitoring the deletion sweep.
//! Increments are fire-and-forget and can never fail a pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Thread-safe metrics for the sweep engine
#[derive(Debug, Clone, Default)]
pub struct SweepMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Child rows deleted across all tables
    deleted_rows: AtomicU64,
    /// Child rows whose reference column was nullified
    updated_rows: AtomicU64,
    /// Deletion events marked processed
    records_processed: AtomicU64,
    /// Deletion events pushed forward after a transient failure
    records_rescheduled: AtomicU64,
    /// Partition rotations performed
    partitions_rotated: AtomicU64,
    /// Drained partitions detached
    partitions_detached: AtomicU64,
    deleted_rows_by_table: Mutex<HashMap<String, u64>>,
    updated_rows_by_table: Mutex<HashMap<String, u64>>,
}

impl SweepMetrics {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record child rows deleted for a table
    pub fn record_deletions(&self, table: &str, count: u64) {
        self.inner.deleted_rows.fetch_add(count, Ordering::Relaxed);
        if let Ok(mut by_table) = self.inner.deleted_rows_by_table.lock() {
            *by_table.entry(table.to_string()).or_insert(0) += count;
        }
    }

    /// Record child rows nullified for a table
    pub fn record_updates(&self, table: &str, count: u64) {
        self.inner.updated_rows.fetch_add(count, Ordering::Relaxed);
        if let Ok(mut by_table) = self.inner.updated_rows_by_table.lock() {
            *by_table.entry(table.to_string()).or_insert(0) += count;
        }
    }

    /// Record deletion events marked processed
    pub fn record_records_processed(&self, count: u64) {
        self.inner
            .records_processed
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record deletion events rescheduled for retry
    pub fn record_records_rescheduled(&self, count: u64) {
        self.inner
            .records_rescheduled
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record a partition rotation
    pub fn record_partition_rotated(&self) {
        self.inner.partitions_rotated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a partition detachment
    pub fn record_partition_detached(&self) {
        self.inner
            .partitions_detached
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get total child rows deleted
    pub fn deleted_rows(&self) -> u64 {
        self.inner.deleted_rows.load(Ordering::Relaxed)
    }

    /// Get total child rows nullified
    pub fn updated_rows(&self) -> u64 {
        self.inner.updated_rows.load(Ordering::Relaxed)
    }

    /// Get child rows deleted for one table
    pub fn deleted_rows_for(&self, table: &str) -> u64 {
        self.inner
            .deleted_rows_by_table
            .lock()
            .map(|by_table| by_table.get(table).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Get child rows nullified for one table
    pub fn updated_rows_for(&self, table: &str) -> u64 {
        self.inner
            .updated_rows_by_table
            .lock()
            .map(|by_table| by_table.get(table).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Get total deletion events marked processed
    pub fn records_processed(&self) -> u64 {
        self.inner.records_processed.load(Ordering::Relaxed)
    }

    /// Get total deletion events rescheduled
    pub fn records_rescheduled(&self) -> u64 {
        self.inner.records_rescheduled.load(Ordering::Relaxed)
    }

    /// Get total partition rotations
    pub fn partitions_rotated(&self) -> u64 {
        self.inner.partitions_rotated.load(Ordering::Relaxed)
    }

    /// Get total partition detachments
    pub fn partitions_detached(&self) -> u64 {
        self.inner.partitions_detached.load(Ordering::Relaxed)
    }
}
