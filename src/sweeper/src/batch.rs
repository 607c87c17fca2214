//! Batch consumption protocol over the partitioned log.
//!
//! Loading fans out across the partition segments in ascending partition
//! order, each segment pre-sorted by `(consume_after, id)`, and caps the
//! merged result at the requested batch size. That yields the deterministic
//! `(partition, consume_after, id)` consumption order: oldest partitions
//! drain first.
//!
//! Mutations take a previously loaded batch, group it by partition so every
//! UPDATE is scoped to a single segment, and only touch rows still in
//! `pending` status. An event already processed by a racing consumer is
//! skipped silently, which makes all three transitions idempotent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{Row, query};

use crate::event_log::{EventLog, LogDatabase, segment_table};
use crate::model::{DeletedRecord, RecordStatus};

pub(crate) fn sqlite_placeholders(count: usize) -> String {
    (0..count).map(|_| "?").collect::<Vec<_>>().join(", ")
}

fn group_by_partition(records: &[DeletedRecord]) -> BTreeMap<i64, Vec<i64>> {
    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for record in records {
        groups.entry(record.partition).or_default().push(record.id);
    }
    groups
}

enum BatchUpdate {
    MarkProcessed,
    Reschedule(DateTime<Utc>),
    IncrementAttempts,
}

impl EventLog {
    /// Load up to `batch_size` pending, eligible events for `table` in
    /// deterministic `(partition, consume_after, id)` order.
    pub async fn load_batch(
        &self,
        table: &str,
        batch_size: usize,
    ) -> Result<Vec<DeletedRecord>, sqlx::Error> {
        let now = Utc::now();
        let mut batch: Vec<DeletedRecord> = Vec::new();

        for partition in self.partitions().await? {
            if batch.len() >= batch_size {
                break;
            }
            let remaining = (batch_size - batch.len()) as i64;
            let segment = segment_table(partition.number);

            match &self.db {
                LogDatabase::Sqlite(pool) => {
                    let stmt = format!(
                        "SELECT id, fully_qualified_table_name, primary_key_value, status, consume_after, cleanup_attempts, created_at \
                         FROM {segment} \
                         WHERE fully_qualified_table_name = ? AND status = 1 AND consume_after <= ? \
                         ORDER BY consume_after ASC, id ASC LIMIT ?"
                    );
                    let rows = query(&stmt)
                        .bind(table)
                        .bind(now)
                        .bind(remaining)
                        .fetch_all(pool)
                        .await?;
                    for row in rows {
                        let status = RecordStatus::from_i64(row.get::<i64, _>("status"))
                            .ok_or_else(|| {
                                sqlx::Error::Decode("unknown deletion event status code".into())
                            })?;
                        batch.push(DeletedRecord {
                            partition: partition.number,
                            id: row.get("id"),
                            fully_qualified_table_name: row.get("fully_qualified_table_name"),
                            primary_key_value: row.get("primary_key_value"),
                            status,
                            consume_after: row.get("consume_after"),
                            cleanup_attempts: row.get("cleanup_attempts"),
                            created_at: row.get("created_at"),
                        });
                    }
                }
                LogDatabase::Postgres(pool) => {
                    let stmt = format!(
                        "SELECT id, fully_qualified_table_name, primary_key_value, status, consume_after, cleanup_attempts, created_at \
                         FROM {segment} \
                         WHERE fully_qualified_table_name = $1 AND status = 1 AND consume_after <= $2 \
                         ORDER BY consume_after ASC, id ASC LIMIT $3"
                    );
                    let rows = query(&stmt)
                        .bind(table)
                        .bind(now)
                        .bind(remaining)
                        .fetch_all(pool)
                        .await?;
                    for row in rows {
                        let status =
                            RecordStatus::from_i64(i64::from(row.get::<i32, _>("status")))
                                .ok_or_else(|| {
                                    sqlx::Error::Decode(
                                        "unknown deletion event status code".into(),
                                    )
                                })?;
                        batch.push(DeletedRecord {
                            partition: partition.number,
                            id: row.get("id"),
                            fully_qualified_table_name: row.get("fully_qualified_table_name"),
                            primary_key_value: row.get("primary_key_value"),
                            status,
                            consume_after: row.get("consume_after"),
                            cleanup_attempts: i64::from(row.get::<i32, _>("cleanup_attempts")),
                            created_at: row.get("created_at"),
                        });
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Mark a previously loaded batch as processed.
    ///
    /// Returns the number of rows actually flipped; events a racing
    /// consumer already processed count zero and raise nothing.
    pub async fn mark_processed(&self, records: &[DeletedRecord]) -> Result<u64, sqlx::Error> {
        self.update_batch(records, BatchUpdate::MarkProcessed).await
    }

    /// Push a batch's eligibility forward after a transient cleanup failure.
    ///
    /// Sets `consume_after` and resets `cleanup_attempts` to zero for the
    /// still-pending events of the batch.
    pub async fn reschedule(
        &self,
        records: &[DeletedRecord],
        consume_after: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        self.update_batch(records, BatchUpdate::Reschedule(consume_after))
            .await
    }

    /// Bump `cleanup_attempts` for the still-pending events of a batch.
    ///
    /// Deliberately naive under concurrent access; the count only feeds an
    /// external give-up policy and does not need to be exact.
    pub async fn increment_attempts(&self, records: &[DeletedRecord]) -> Result<u64, sqlx::Error> {
        self.update_batch(records, BatchUpdate::IncrementAttempts)
            .await
    }

    async fn update_batch(
        &self,
        records: &[DeletedRecord],
        update: BatchUpdate,
    ) -> Result<u64, sqlx::Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut affected = 0u64;
        for (partition, ids) in group_by_partition(records) {
            let segment = segment_table(partition);
            match &self.db {
                LogDatabase::Sqlite(pool) => {
                    let (set_clause, consume_after) = match &update {
                        BatchUpdate::MarkProcessed => ("status = 2", None),
                        BatchUpdate::Reschedule(at) => {
                            ("consume_after = ?, cleanup_attempts = 0", Some(*at))
                        }
                        BatchUpdate::IncrementAttempts => {
                            ("cleanup_attempts = cleanup_attempts + 1", None)
                        }
                    };
                    let stmt = format!(
                        "UPDATE {segment} SET {set_clause} WHERE status = 1 AND id IN ({})",
                        sqlite_placeholders(ids.len())
                    );
                    let mut update_query = query(&stmt);
                    if let Some(at) = consume_after {
                        update_query = update_query.bind(at);
                    }
                    for id in &ids {
                        update_query = update_query.bind(*id);
                    }
                    affected += update_query.execute(pool).await?.rows_affected();
                }
                LogDatabase::Postgres(pool) => {
                    let (set_clause, consume_after) = match &update {
                        BatchUpdate::MarkProcessed => ("status = 2", None),
                        BatchUpdate::Reschedule(at) => {
                            ("consume_after = $2, cleanup_attempts = 0", Some(*at))
                        }
                        BatchUpdate::IncrementAttempts => {
                            ("cleanup_attempts = cleanup_attempts + 1", None)
                        }
                    };
                    let stmt = format!(
                        "UPDATE {segment} SET {set_clause} WHERE status = 1 AND id = ANY($1)"
                    );
                    let mut update_query = query(&stmt).bind(ids.as_slice());
                    if let Some(at) = consume_after {
                        update_query = update_query.bind(at);
                    }
                    affected += update_query.execute(pool).await?.rows_affected();
                }
            }
        }

        Ok(affected)
    }
}
