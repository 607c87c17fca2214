//! Asynchronous deletion-propagation engine.
//!
//! Hot tables in a sharded relational store skip database-level foreign
//! keys; when a parent row is deleted, an event lands in a partitioned,
//! append-only deletion log. This crate drains that log: a budgeted worker
//! loads bounded batches of events, applies per-relation cleanup actions to
//! the child tables (delete or nullify), and rotates/detaches log
//! partitions to keep the backlog physically bounded.

pub mod batch;
pub mod cleaner;
pub mod event_log;
pub mod metrics;
pub mod model;
pub mod tracker;
pub mod worker;

pub use cleaner::{
    ChildCleanup, CleanupAction, CleanupOutcome, MutationKind, PolicyRegistry, RelationPolicy,
    apply_cleanup,
};
pub use event_log::{EventLog, LogDatabase};
pub use metrics::SweepMetrics;
pub use model::{DeletedRecord, Partition, RecordStatus};
pub use tracker::{ModificationTracker, TrackerStats, TrackerVariant};
pub use worker::{PassStats, SweepWorker};
