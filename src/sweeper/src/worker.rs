//! Sweep worker.
//!
//! One `run_pass` call is one bounded unit of cleanup work: rotate and
//! detach partitions if due, then drain deletion events table by table in
//! round-robin order until every table is exhausted or the modification
//! budget runs out. The budget is consulted between batches only, so a
//! started batch always finishes.
//!
//! Cleanup failures are expected (a child table may be mid-migration or
//! locked) and never abort the pass: the affected batch is pushed into the
//! future and the worker moves on. Only log-store errors propagate.

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

use common::config::SweepConfig;

use crate::cleaner::{MutationKind, PolicyRegistry, RelationPolicy, apply_cleanup};
use crate::event_log::EventLog;
use crate::metrics::SweepMetrics;
use crate::model::DeletedRecord;
use crate::tracker::{ModificationTracker, TrackerVariant};

/// Outcome of a single sweep pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassStats {
    /// Parent tables that had at least one batch loaded
    pub tables_processed: usize,
    /// Batches loaded across all tables
    pub batches_processed: usize,
    /// Deletion events marked processed
    pub records_processed: u64,
    /// Deletion events pushed forward after a transient cleanup failure
    pub records_rescheduled: u64,
    /// Events with an unusable primary key, left pending with a bumped
    /// attempt count
    pub malformed_records: u64,
    /// Events for tables no relation policy covers
    pub unrecognized_records: u64,
    /// Whether this pass opened a new log partition
    pub rotated: bool,
    /// Partition detached by this pass, if any
    pub detached_partition: Option<i64>,
    /// Whether the pass stopped on budget exhaustion
    pub over_limit: bool,
    pub delete_count: u64,
    pub update_count: u64,
    pub delete_count_by_table: HashMap<String, u64>,
    pub update_count_by_table: HashMap<String, u64>,
    pub duration_ms: u64,
}

/// Drains the deletion log by applying relation cleanup policies.
pub struct SweepWorker {
    log: EventLog,
    registry: PolicyRegistry,
    metrics: SweepMetrics,
    retry_backoff: ChronoDuration,
    default_batch_size: usize,
}

enum BatchOutcome {
    /// All cleanup actions succeeded; drained if the batch came up short.
    Advanced { drained: bool },
    /// A cleanup action failed and the batch was rescheduled.
    Deferred,
}

impl SweepWorker {
    pub fn new(
        log: EventLog,
        config: &SweepConfig,
        metrics: SweepMetrics,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .context("invalid sweep configuration")?;
        let retry_backoff = ChronoDuration::from_std(config.retry_backoff)
            .context("retry backoff out of range")?;
        Ok(Self {
            log,
            registry: PolicyRegistry::from_config(config),
            metrics,
            retry_backoff,
            default_batch_size: config.default_batch_size,
        })
    }

    pub fn metrics(&self) -> &SweepMetrics {
        &self.metrics
    }

    /// Run one sweep pass under the given budget preset.
    pub async fn run_pass(&self, variant: TrackerVariant) -> anyhow::Result<PassStats> {
        self.run_pass_with_tracker(ModificationTracker::new(variant, self.metrics.clone()))
            .await
    }

    /// Run one sweep pass against an explicit budget tracker.
    pub async fn run_pass_with_tracker(
        &self,
        mut tracker: ModificationTracker,
    ) -> anyhow::Result<PassStats> {
        let started = Instant::now();

        let rotated = self
            .log
            .rotate_if_needed()
            .await
            .context("failed to rotate deletion log")?;
        if rotated {
            self.metrics.record_partition_rotated();
        }
        let detached_partition = self
            .log
            .maybe_detach_oldest()
            .await
            .context("failed to detach drained partition")?;
        if detached_partition.is_some() {
            self.metrics.record_partition_detached();
        }

        let mut stats = PassStats {
            tables_processed: 0,
            batches_processed: 0,
            records_processed: 0,
            records_rescheduled: 0,
            malformed_records: 0,
            unrecognized_records: 0,
            rotated,
            detached_partition,
            over_limit: false,
            delete_count: 0,
            update_count: 0,
            delete_count_by_table: HashMap::new(),
            update_count_by_table: HashMap::new(),
            duration_ms: 0,
        };

        stats.unrecognized_records = self.flag_unrecognized_tables().await?;

        let policies: Vec<&RelationPolicy> = self.registry.policies().collect();
        let mut queue: VecDeque<usize> = (0..policies.len()).collect();
        let mut touched = vec![false; policies.len()];

        while let Some(index) = queue.pop_front() {
            if tracker.over_limit() {
                stats.over_limit = true;
                break;
            }
            let policy = policies[index];

            let batch = self
                .log
                .load_batch(&policy.parent_table, policy.batch_size)
                .await
                .with_context(|| {
                    format!("failed to load deletion batch for {}", policy.parent_table)
                })?;
            if batch.is_empty() {
                continue;
            }

            if !touched[index] {
                touched[index] = true;
                stats.tables_processed += 1;
            }
            stats.batches_processed += 1;
            let full = batch.len() == policy.batch_size;

            match self
                .process_batch(policy, batch, &mut tracker, &mut stats)
                .await?
            {
                BatchOutcome::Advanced { drained } => {
                    if full && !drained {
                        queue.push_back(index);
                    }
                }
                // After a failure the rest of the table likely fails the
                // same way; leave it for the next pass.
                BatchOutcome::Deferred => {}
            }
        }

        let tracker_stats = tracker.stats();
        stats.over_limit = stats.over_limit || tracker_stats.over_limit;
        stats.delete_count = tracker_stats.delete_count;
        stats.update_count = tracker_stats.update_count;
        stats.delete_count_by_table = tracker_stats.delete_count_by_table;
        stats.update_count_by_table = tracker_stats.update_count_by_table;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            records_processed = stats.records_processed,
            records_rescheduled = stats.records_rescheduled,
            delete_count = stats.delete_count,
            update_count = stats.update_count,
            over_limit = stats.over_limit,
            "sweep pass finished"
        );
        Ok(stats)
    }

    /// Bump the attempt count on pending events whose table has no relation
    /// policy. They stay pending so an operator can spot them through the
    /// rising count and either add the relation or discard the events.
    async fn flag_unrecognized_tables(&self) -> anyhow::Result<u64> {
        let mut flagged = 0u64;
        for table in self
            .log
            .pending_tables()
            .await
            .context("failed to list pending tables")?
        {
            if self.registry.lookup(&table).is_some() {
                continue;
            }
            let batch = self
                .log
                .load_batch(&table, self.default_batch_size)
                .await
                .with_context(|| format!("failed to load deletion batch for {table}"))?;
            warn!(
                table = table.as_str(),
                events = batch.len(),
                "deletion events for a table without a relation policy"
            );
            flagged += self
                .log
                .increment_attempts(&batch)
                .await
                .context("failed to bump attempts on unrecognized events")?;
        }
        Ok(flagged)
    }

    async fn process_batch(
        &self,
        policy: &RelationPolicy,
        batch: Vec<DeletedRecord>,
        tracker: &mut ModificationTracker,
        stats: &mut PassStats,
    ) -> anyhow::Result<BatchOutcome> {
        let batch_len = batch.len();
        let (valid, malformed): (Vec<DeletedRecord>, Vec<DeletedRecord>) = batch
            .into_iter()
            .partition(|record| record.primary_key_value > 0);

        if !malformed.is_empty() {
            warn!(
                table = policy.parent_table.as_str(),
                events = malformed.len(),
                "deletion events with unusable primary keys"
            );
            self.log
                .increment_attempts(&malformed)
                .await
                .context("failed to bump attempts on malformed events")?;
            stats.malformed_records += malformed.len() as u64;
        }
        if valid.is_empty() {
            // Nothing actionable; stop this table for the pass so the
            // malformed remainder cannot be reloaded in a loop.
            return Ok(BatchOutcome::Advanced { drained: true });
        }

        let keys: Vec<i64> = valid.iter().map(|r| r.primary_key_value).collect();
        for child in &policy.children {
            match apply_cleanup(&self.log, child, &keys).await {
                Ok(outcome) => match outcome.kind {
                    MutationKind::Deleted => {
                        tracker.add_deletions(&child.table, outcome.rows_affected);
                    }
                    MutationKind::Updated => {
                        tracker.add_updates(&child.table, outcome.rows_affected);
                    }
                },
                Err(error) => {
                    warn!(
                        parent_table = policy.parent_table.as_str(),
                        child_table = child.table.as_str(),
                        %error,
                        "cleanup failed, rescheduling batch"
                    );
                    let rescheduled = self
                        .log
                        .reschedule(&valid, Utc::now() + self.retry_backoff)
                        .await
                        .context("failed to reschedule deletion batch")?;
                    self.metrics.record_records_rescheduled(rescheduled);
                    stats.records_rescheduled += rescheduled;
                    return Ok(BatchOutcome::Deferred);
                }
            }
        }

        let processed = self
            .log
            .mark_processed(&valid)
            .await
            .context("failed to mark deletion batch processed")?;
        self.metrics.record_records_processed(processed);
        stats.records_processed += processed;

        Ok(BatchOutcome::Advanced {
            drained: batch_len < policy.batch_size,
        })
    }
}
