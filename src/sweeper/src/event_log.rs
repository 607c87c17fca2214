//! Partitioned deletion event log.
//!
//! The log is a sliding window of physically separate segment tables
//! (`deletion_log_p<N>`) plus a control table recording which partition is
//! the current write target. Appends go to the active partition; a new
//! partition is opened once the oldest event in the active one crosses the
//! rotation interval, and fully drained partitions are removed oldest-first
//! by dropping their segment table, which is the only way events ever leave
//! the log.
//!
//! Rotation and detachment are administrative operations: both mutate the
//! control table through conditional updates, and a lost race rolls back as
//! a silent no-op to be retried on the next invocation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, Row, SqlitePool, query};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::model::Partition;

/// Name of the physical segment table backing a partition.
pub(crate) fn segment_table(partition: i64) -> String {
    format!("deletion_log_p{partition}")
}

/// Database handle for the deletion log (PostgreSQL or SQLite).
#[derive(Clone)]
pub enum LogDatabase {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Partitioned, append-only store for deletion events.
#[derive(Clone)]
pub struct EventLog {
    pub(crate) db: LogDatabase,
    rotation_interval: ChronoDuration,
}

impl EventLog {
    /// Connect to the log database and initialize the schema.
    pub async fn connect(dsn: &str, rotation_interval: Duration) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to deletion log database with DSN: {dsn}");

        let db = if dsn.starts_with("sqlite:") {
            let pool = if dsn.contains(":memory:") {
                // An in-memory SQLite database exists per connection; a
                // second pool connection would see an empty database.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect(dsn)
                    .await?
            } else {
                // Add mode=rwc to create the database file if it doesn't exist
                let dsn_with_create = if dsn.contains('?') {
                    if dsn.contains("mode=") {
                        dsn.to_string()
                    } else {
                        format!("{dsn}&mode=rwc")
                    }
                } else {
                    format!("{dsn}?mode=rwc")
                };
                SqlitePool::connect(&dsn_with_create).await?
            };
            LogDatabase::Sqlite(pool)
        } else {
            LogDatabase::Postgres(PgPool::connect(dsn).await?)
        };

        let rotation_interval = ChronoDuration::from_std(rotation_interval)
            .map_err(|_| sqlx::Error::Configuration("rotation interval out of range".into()))?;

        let event_log = Self {
            db,
            rotation_interval,
        };
        event_log.init().await?;
        Ok(event_log)
    }

    /// Access the underlying database handle.
    pub fn database(&self) -> &LogDatabase {
        &self.db
    }

    /// Initialize the control table and the first partition if they do not exist.
    async fn init(&self) -> Result<(), sqlx::Error> {
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let create_partitions = r#"
                CREATE TABLE IF NOT EXISTS deletion_log_partitions (
                    number INTEGER PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 0
                )"#;
                query(create_partitions).execute(pool).await?;
            }
            LogDatabase::Postgres(pool) => {
                let create_partitions = r#"
                CREATE TABLE IF NOT EXISTS deletion_log_partitions (
                    number BIGINT PRIMARY KEY,
                    created_at TIMESTAMPTZ NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT FALSE
                )"#;
                query(create_partitions).execute(pool).await?;
            }
        }

        if self.partitions().await?.is_empty() {
            self.create_segment(1).await?;
            let now = Utc::now();
            match &self.db {
                LogDatabase::Sqlite(pool) => {
                    let stmt = r#"
                    INSERT OR IGNORE INTO deletion_log_partitions (number, created_at, active)
                    VALUES (1, ?, 1)
                    "#;
                    query(stmt).bind(now).execute(pool).await?;
                }
                LogDatabase::Postgres(pool) => {
                    let stmt = r#"
                    INSERT INTO deletion_log_partitions (number, created_at, active)
                    VALUES (1, $1, TRUE)
                    ON CONFLICT (number) DO NOTHING
                    "#;
                    query(stmt).bind(now).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    /// Create the physical segment table for a partition.
    async fn create_segment(&self, partition: i64) -> Result<(), sqlx::Error> {
        let segment = segment_table(partition);
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let stmt = format!(
                    r#"
                CREATE TABLE IF NOT EXISTS {segment} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    fully_qualified_table_name TEXT NOT NULL,
                    primary_key_value INTEGER NOT NULL,
                    status INTEGER NOT NULL DEFAULT 1,
                    consume_after TEXT NOT NULL,
                    cleanup_attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )"#
                );
                query(&stmt).execute(pool).await?;
            }
            LogDatabase::Postgres(pool) => {
                let stmt = format!(
                    r#"
                CREATE TABLE IF NOT EXISTS {segment} (
                    id BIGSERIAL PRIMARY KEY,
                    fully_qualified_table_name TEXT NOT NULL,
                    primary_key_value BIGINT NOT NULL,
                    status INTEGER NOT NULL DEFAULT 1,
                    consume_after TIMESTAMPTZ NOT NULL,
                    cleanup_attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL
                )"#
                );
                query(&stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// List all live partitions in ascending number order.
    pub async fn partitions(&self) -> Result<Vec<Partition>, sqlx::Error> {
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let rows = query(
                    "SELECT number, created_at, active FROM deletion_log_partitions ORDER BY number ASC",
                )
                .fetch_all(pool)
                .await?;
                let mut partitions = Vec::with_capacity(rows.len());
                for row in rows {
                    partitions.push(Partition {
                        number: row.get("number"),
                        created_at: row.get("created_at"),
                        active: row.get("active"),
                    });
                }
                Ok(partitions)
            }
            LogDatabase::Postgres(pool) => {
                let rows = query(
                    "SELECT number, created_at, active FROM deletion_log_partitions ORDER BY number ASC",
                )
                .fetch_all(pool)
                .await?;
                let mut partitions = Vec::with_capacity(rows.len());
                for row in rows {
                    partitions.push(Partition {
                        number: row.get("number"),
                        created_at: row.get("created_at"),
                        active: row.get("active"),
                    });
                }
                Ok(partitions)
            }
        }
    }

    /// The partition currently accepting writes.
    pub async fn active_partition(&self) -> Result<Partition, sqlx::Error> {
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let row = query(
                    "SELECT number, created_at FROM deletion_log_partitions WHERE active = 1 ORDER BY number DESC LIMIT 1",
                )
                .fetch_one(pool)
                .await?;
                Ok(Partition {
                    number: row.get("number"),
                    created_at: row.get("created_at"),
                    active: true,
                })
            }
            LogDatabase::Postgres(pool) => {
                let row = query(
                    "SELECT number, created_at FROM deletion_log_partitions WHERE active ORDER BY number DESC LIMIT 1",
                )
                .fetch_one(pool)
                .await?;
                Ok(Partition {
                    number: row.get("number"),
                    created_at: row.get("created_at"),
                    active: true,
                })
            }
        }
    }

    /// The active partition number, rotating first when rotation is due.
    pub async fn current_partition(&self) -> Result<i64, sqlx::Error> {
        self.rotate_if_needed().await?;
        Ok(self.active_partition().await?.number)
    }

    /// Open a new partition when the oldest event in the active partition is
    /// older than the rotation interval. Returns whether a rotation happened.
    pub async fn rotate_if_needed(&self) -> Result<bool, sqlx::Error> {
        let active = self.active_partition().await?;
        let due = match self.oldest_event_at(active.number).await? {
            Some(oldest) => Utc::now() - oldest >= self.rotation_interval,
            None => false,
        };
        if !due {
            return Ok(false);
        }
        self.rotate(active.number).await
    }

    /// Creation time of the oldest event in a partition, if any.
    async fn oldest_event_at(&self, partition: i64) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let stmt = format!(
            "SELECT MIN(created_at) AS oldest FROM {}",
            segment_table(partition)
        );
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let row = query(&stmt).fetch_one(pool).await?;
                row.try_get("oldest")
            }
            LogDatabase::Postgres(pool) => {
                let row = query(&stmt).fetch_one(pool).await?;
                row.try_get("oldest")
            }
        }
    }

    /// Make `from + 1` the new write target.
    ///
    /// The old active row is demoted with a conditional update; zero rows
    /// affected means a concurrent rotation won and the whole transaction
    /// unwinds as a no-op.
    async fn rotate(&self, from: i64) -> Result<bool, sqlx::Error> {
        let next = from + 1;
        self.create_segment(next).await?;
        let now = Utc::now();

        let rotated = match &self.db {
            LogDatabase::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                let demoted = query(
                    "UPDATE deletion_log_partitions SET active = 0 WHERE number = ? AND active = 1",
                )
                .bind(from)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if demoted == 0 {
                    tx.rollback().await?;
                    false
                } else {
                    let inserted = query(
                        "INSERT INTO deletion_log_partitions (number, created_at, active) VALUES (?, ?, 1)",
                    )
                    .bind(next)
                    .bind(now)
                    .execute(&mut *tx)
                    .await;
                    match inserted {
                        Ok(_) => {
                            tx.commit().await?;
                            true
                        }
                        Err(_) => {
                            tx.rollback().await?;
                            false
                        }
                    }
                }
            }
            LogDatabase::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                let demoted = query(
                    "UPDATE deletion_log_partitions SET active = FALSE WHERE number = $1 AND active",
                )
                .bind(from)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if demoted == 0 {
                    tx.rollback().await?;
                    false
                } else {
                    let inserted = query(
                        "INSERT INTO deletion_log_partitions (number, created_at, active) VALUES ($1, $2, TRUE)",
                    )
                    .bind(next)
                    .bind(now)
                    .execute(&mut *tx)
                    .await;
                    match inserted {
                        Ok(_) => {
                            tx.commit().await?;
                            true
                        }
                        Err(_) => {
                            tx.rollback().await?;
                            false
                        }
                    }
                }
            }
        };

        if rotated {
            info!(partition = next, "opened new active log partition");
        } else {
            warn!(
                partition = next,
                "lost partition rotation race, leaving log unchanged"
            );
        }
        Ok(rotated)
    }

    /// Record that `primary_key_value` disappeared from `table`.
    ///
    /// The event lands in the currently active partition with
    /// `consume_after = created_at = now`. Meant to run alongside the
    /// parent row's deletion.
    pub async fn append(&self, table: &str, primary_key_value: i64) -> Result<(), sqlx::Error> {
        let partition = self.current_partition().await?;
        let segment = segment_table(partition);
        let now = Utc::now();
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let stmt = format!(
                    "INSERT INTO {segment} (fully_qualified_table_name, primary_key_value, status, consume_after, cleanup_attempts, created_at) VALUES (?, ?, 1, ?, 0, ?)"
                );
                query(&stmt)
                    .bind(table)
                    .bind(primary_key_value)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
            LogDatabase::Postgres(pool) => {
                let stmt = format!(
                    "INSERT INTO {segment} (fully_qualified_table_name, primary_key_value, status, consume_after, cleanup_attempts, created_at) VALUES ($1, $2, 1, $3, 0, $4)"
                );
                query(&stmt)
                    .bind(table)
                    .bind(primary_key_value)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Detach the oldest non-active partition once it holds no pending
    /// events.
    ///
    /// Only the single oldest candidate is ever considered, so partitions
    /// disappear strictly in creation order. Returns the detached partition
    /// number, or `None` when nothing was eligible (including a lost race).
    pub async fn maybe_detach_oldest(&self) -> Result<Option<i64>, sqlx::Error> {
        let oldest = self.partitions().await?.into_iter().find(|p| !p.active);
        let Some(partition) = oldest else {
            return Ok(None);
        };

        if self.pending_count(partition.number).await? > 0 {
            return Ok(None);
        }

        let removed = match &self.db {
            LogDatabase::Sqlite(pool) => {
                query("DELETE FROM deletion_log_partitions WHERE number = ? AND active = 0")
                    .bind(partition.number)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            LogDatabase::Postgres(pool) => {
                query("DELETE FROM deletion_log_partitions WHERE number = $1 AND NOT active")
                    .bind(partition.number)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        if removed == 0 {
            // Lost a race with another detacher; they drop the segment.
            return Ok(None);
        }

        let drop_stmt = format!("DROP TABLE IF EXISTS {}", segment_table(partition.number));
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                query(&drop_stmt).execute(pool).await?;
            }
            LogDatabase::Postgres(pool) => {
                query(&drop_stmt).execute(pool).await?;
            }
        }

        info!(partition = partition.number, "detached drained partition");
        Ok(Some(partition.number))
    }

    /// Number of pending events left in a partition.
    async fn pending_count(&self, partition: i64) -> Result<i64, sqlx::Error> {
        let stmt = format!(
            "SELECT COUNT(*) AS pending FROM {} WHERE status = 1",
            segment_table(partition)
        );
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let row = query(&stmt).fetch_one(pool).await?;
                Ok(row.get("pending"))
            }
            LogDatabase::Postgres(pool) => {
                let row = query(&stmt).fetch_one(pool).await?;
                Ok(row.get("pending"))
            }
        }
    }

    /// Distinct table names that still have eligible pending events.
    pub async fn pending_tables(&self) -> Result<Vec<String>, sqlx::Error> {
        let now = Utc::now();
        let mut tables = BTreeSet::new();
        for partition in self.partitions().await? {
            let stmt = match &self.db {
                LogDatabase::Sqlite(_) => format!(
                    "SELECT DISTINCT fully_qualified_table_name AS name FROM {} WHERE status = 1 AND consume_after <= ?",
                    segment_table(partition.number)
                ),
                LogDatabase::Postgres(_) => format!(
                    "SELECT DISTINCT fully_qualified_table_name AS name FROM {} WHERE status = 1 AND consume_after <= $1",
                    segment_table(partition.number)
                ),
            };
            match &self.db {
                LogDatabase::Sqlite(pool) => {
                    for row in query(&stmt).bind(now).fetch_all(pool).await? {
                        tables.insert(row.get::<String, _>("name"));
                    }
                }
                LogDatabase::Postgres(pool) => {
                    for row in query(&stmt).bind(now).fetch_all(pool).await? {
                        tables.insert(row.get::<String, _>("name"));
                    }
                }
            }
        }
        Ok(tables.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_log(rotation_interval: Duration) -> EventLog {
        EventLog::connect("sqlite::memory:", rotation_interval)
            .await
            .expect("failed to open in-memory log")
    }

    #[tokio::test]
    async fn test_init_creates_first_partition() {
        let event_log = memory_log(Duration::from_secs(3600)).await;

        let partitions = event_log.partitions().await.unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].number, 1);
        assert!(partitions[0].active);
        assert_eq!(event_log.current_partition().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rotation_not_due_with_fresh_events() {
        let event_log = memory_log(Duration::from_secs(3600)).await;

        event_log.append("widgets", 1).await.unwrap();
        event_log.append("widgets", 2).await.unwrap();

        assert!(!event_log.rotate_if_needed().await.unwrap());
        assert_eq!(event_log.current_partition().await.unwrap(), 1);
        assert_eq!(event_log.partitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_on_aged_active_partition() {
        // Zero interval: any event in the active partition makes rotation due.
        let event_log = memory_log(Duration::ZERO).await;

        event_log.append("widgets", 1).await.unwrap();
        assert_eq!(event_log.active_partition().await.unwrap().number, 1);

        // The append itself rotates before inserting.
        event_log.append("widgets", 2).await.unwrap();
        let partitions = event_log.partitions().await.unwrap();
        assert_eq!(partitions.len(), 2);
        assert!(!partitions[0].active);
        assert!(partitions[1].active);
        assert_eq!(partitions[1].number, 2);
    }

    #[tokio::test]
    async fn test_rotation_noop_on_empty_active_partition() {
        let event_log = memory_log(Duration::ZERO).await;
        assert!(!event_log.rotate_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_nothing_without_inactive_partitions() {
        let event_log = memory_log(Duration::from_secs(3600)).await;
        event_log.append("widgets", 1).await.unwrap();
        assert_eq!(event_log.maybe_detach_oldest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_detach_skips_partition_with_pending_events() {
        let event_log = memory_log(Duration::ZERO).await;

        event_log.append("widgets", 1).await.unwrap();
        event_log.append("widgets", 2).await.unwrap();

        // Partition 1 still has a pending event.
        assert_eq!(event_log.maybe_detach_oldest().await.unwrap(), None);
        assert_eq!(event_log.partitions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_is_strictly_oldest_first() {
        let event_log = memory_log(Duration::ZERO).await;

        // One event per partition: t1 -> p1, t2 -> p2, t3 -> p3, t4 -> p4 (active).
        event_log.append("t1", 1).await.unwrap();
        event_log.append("t2", 2).await.unwrap();
        event_log.append("t3", 3).await.unwrap();
        event_log.append("t4", 4).await.unwrap();
        assert_eq!(event_log.partitions().await.unwrap().len(), 4);

        // Drain p1 and p3, leaving p2 pending.
        let batch = event_log.load_batch("t1", 10).await.unwrap();
        event_log.mark_processed(&batch).await.unwrap();
        let batch = event_log.load_batch("t3", 10).await.unwrap();
        event_log.mark_processed(&batch).await.unwrap();

        // Only the oldest drained partition goes; p3 is not touched while
        // p2 still exists.
        assert_eq!(event_log.maybe_detach_oldest().await.unwrap(), Some(1));
        assert_eq!(event_log.maybe_detach_oldest().await.unwrap(), None);

        let numbers: Vec<i64> = event_log
            .partitions()
            .await
            .unwrap()
            .iter()
            .map(|p| p.number)
            .collect();
        assert_eq!(numbers, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_detached_events_are_gone() {
        let event_log = memory_log(Duration::ZERO).await;

        event_log.append("t1", 1).await.unwrap();
        event_log.append("t2", 2).await.unwrap();

        let batch = event_log.load_batch("t1", 10).await.unwrap();
        event_log.mark_processed(&batch).await.unwrap();
        assert_eq!(event_log.maybe_detach_oldest().await.unwrap(), Some(1));

        // The processed event disappeared with its partition.
        assert!(event_log.load_batch("t1", 10).await.unwrap().is_empty());
        assert_eq!(event_log.pending_tables().await.unwrap(), vec!["t2"]);
    }
}
