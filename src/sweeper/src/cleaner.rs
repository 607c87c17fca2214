//! Relation cleanup policies.
//!
//! Maps a parent table to the concrete mutations that repair its child
//! tables once parent rows are gone. Dispatch is a registry lookup over a
//! closed tagged variant rather than anything dynamic: a child relation
//! either deletes its rows or nullifies the dangling reference column.

use std::collections::BTreeMap;

use common::config::{OnDelete, SweepConfig};
use sqlx::query;

use crate::batch::sqlite_placeholders;
use crate::event_log::{EventLog, LogDatabase};

/// What to do with child rows referencing a deleted parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Delete the referencing rows.
    DeleteRow,
    /// Set the named column to NULL, keeping the rows.
    NullifyColumn(String),
}

/// One child table cleaned up on behalf of a parent.
#[derive(Debug, Clone)]
pub struct ChildCleanup {
    pub table: String,
    /// Column holding the parent's primary key
    pub column: String,
    pub action: CleanupAction,
}

/// All cleanup work attached to one parent table.
#[derive(Debug, Clone)]
pub struct RelationPolicy {
    pub parent_table: String,
    /// Deletion events loaded per batch for this parent
    pub batch_size: usize,
    pub children: Vec<ChildCleanup>,
}

/// Registry of relation policies, keyed by parent table name.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, RelationPolicy>,
}

impl PolicyRegistry {
    /// Build the registry from validated configuration.
    pub fn from_config(config: &SweepConfig) -> Self {
        let mut policies = BTreeMap::new();
        for (parent_table, relation) in &config.relations {
            let children = relation
                .children
                .iter()
                .map(|child| {
                    let action = match child.on_delete {
                        OnDelete::AsyncDelete => CleanupAction::DeleteRow,
                        OnDelete::AsyncNullify => {
                            CleanupAction::NullifyColumn(child.column.clone())
                        }
                    };
                    ChildCleanup {
                        table: child.table.clone(),
                        column: child.column.clone(),
                        action,
                    }
                })
                .collect();
            policies.insert(
                parent_table.clone(),
                RelationPolicy {
                    parent_table: parent_table.clone(),
                    batch_size: relation.batch_size.unwrap_or(config.default_batch_size),
                    children,
                },
            );
        }
        Self { policies }
    }

    pub fn lookup(&self, parent_table: &str) -> Option<&RelationPolicy> {
        self.policies.get(parent_table)
    }

    /// Policies in stable (alphabetical) order, which fixes the worker's
    /// round-robin order across parent tables.
    pub fn policies(&self) -> impl Iterator<Item = &RelationPolicy> {
        self.policies.values()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }
}

/// Kind of mutation a cleanup action performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Deleted,
    Updated,
}

/// Row count of one executed cleanup action.
#[derive(Debug, Clone, Copy)]
pub struct CleanupOutcome {
    pub kind: MutationKind,
    pub rows_affected: u64,
}

/// Apply one child relation's cleanup action for a set of parent keys.
pub async fn apply_cleanup(
    event_log: &EventLog,
    child: &ChildCleanup,
    keys: &[i64],
) -> Result<CleanupOutcome, sqlx::Error> {
    match &child.action {
        CleanupAction::DeleteRow => {
            let rows_affected = event_log
                .delete_referencing_rows(&child.table, &child.column, keys)
                .await?;
            Ok(CleanupOutcome {
                kind: MutationKind::Deleted,
                rows_affected,
            })
        }
        CleanupAction::NullifyColumn(column) => {
            let rows_affected = event_log
                .nullify_references(&child.table, column, keys)
                .await?;
            Ok(CleanupOutcome {
                kind: MutationKind::Updated,
                rows_affected,
            })
        }
    }
}

impl EventLog {
    /// Delete child rows whose reference column matches one of `keys`.
    pub async fn delete_referencing_rows(
        &self,
        table: &str,
        column: &str,
        keys: &[i64],
    ) -> Result<u64, sqlx::Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let stmt = format!(
                    "DELETE FROM {table} WHERE {column} IN ({})",
                    sqlite_placeholders(keys.len())
                );
                let mut delete_query = query(&stmt);
                for key in keys {
                    delete_query = delete_query.bind(*key);
                }
                Ok(delete_query.execute(pool).await?.rows_affected())
            }
            LogDatabase::Postgres(pool) => {
                let stmt = format!("DELETE FROM {table} WHERE {column} = ANY($1)");
                Ok(query(&stmt)
                    .bind(keys)
                    .execute(pool)
                    .await?
                    .rows_affected())
            }
        }
    }

    /// Null out child references matching one of `keys`.
    pub async fn nullify_references(
        &self,
        table: &str,
        column: &str,
        keys: &[i64],
    ) -> Result<u64, sqlx::Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        match &self.db {
            LogDatabase::Sqlite(pool) => {
                let stmt = format!(
                    "UPDATE {table} SET {column} = NULL WHERE {column} IN ({})",
                    sqlite_placeholders(keys.len())
                );
                let mut nullify_query = query(&stmt);
                for key in keys {
                    nullify_query = nullify_query.bind(*key);
                }
                Ok(nullify_query.execute(pool).await?.rows_affected())
            }
            LogDatabase::Postgres(pool) => {
                let stmt = format!("UPDATE {table} SET {column} = NULL WHERE {column} = ANY($1)");
                Ok(query(&stmt)
                    .bind(keys)
                    .execute(pool)
                    .await?
                    .rows_affected())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{ChildRelation, RelationConfig};
    use std::time::Duration;

    async fn memory_log() -> EventLog {
        EventLog::connect("sqlite::memory:", Duration::from_secs(3600))
            .await
            .expect("failed to open in-memory log")
    }

    async fn exec(event_log: &EventLog, stmt: &str) {
        match event_log.database() {
            LogDatabase::Sqlite(pool) => {
                query(stmt).execute(pool).await.unwrap();
            }
            LogDatabase::Postgres(_) => unreachable!("tests run against sqlite"),
        }
    }

    async fn count(event_log: &EventLog, stmt: &str) -> i64 {
        match event_log.database() {
            LogDatabase::Sqlite(pool) => {
                use sqlx::Row;
                query(stmt).fetch_one(pool).await.unwrap().get(0)
            }
            LogDatabase::Postgres(_) => unreachable!("tests run against sqlite"),
        }
    }

    fn sample_config() -> SweepConfig {
        let mut config = SweepConfig::default();
        config.relations.insert(
            "projects".to_string(),
            RelationConfig {
                batch_size: Some(250),
                children: vec![
                    ChildRelation {
                        table: "issues".to_string(),
                        column: "project_id".to_string(),
                        on_delete: OnDelete::AsyncDelete,
                    },
                    ChildRelation {
                        table: "merge_requests".to_string(),
                        column: "target_project_id".to_string(),
                        on_delete: OnDelete::AsyncNullify,
                    },
                ],
            },
        );
        config.relations.insert(
            "users".to_string(),
            RelationConfig {
                batch_size: None,
                children: vec![ChildRelation {
                    table: "keys".to_string(),
                    column: "user_id".to_string(),
                    on_delete: OnDelete::AsyncDelete,
                }],
            },
        );
        config
    }

    #[test]
    fn test_registry_from_config() {
        let registry = PolicyRegistry::from_config(&sample_config());
        assert_eq!(registry.len(), 2);

        let projects = registry.lookup("projects").unwrap();
        assert_eq!(projects.batch_size, 250);
        assert_eq!(projects.children.len(), 2);
        assert_eq!(projects.children[0].action, CleanupAction::DeleteRow);
        assert_eq!(
            projects.children[1].action,
            CleanupAction::NullifyColumn("target_project_id".to_string())
        );

        // Missing batch size falls back to the default.
        let users = registry.lookup("users").unwrap();
        assert_eq!(users.batch_size, 1000);

        assert!(registry.lookup("pipelines").is_none());
    }

    #[test]
    fn test_registry_iteration_order_is_stable() {
        let registry = PolicyRegistry::from_config(&sample_config());
        let parents: Vec<&str> = registry
            .policies()
            .map(|p| p.parent_table.as_str())
            .collect();
        assert_eq!(parents, vec!["projects", "users"]);
    }

    #[tokio::test]
    async fn test_delete_referencing_rows() {
        let event_log = memory_log().await;
        exec(
            &event_log,
            "CREATE TABLE issues (id INTEGER PRIMARY KEY, project_id INTEGER)",
        )
        .await;
        exec(
            &event_log,
            "INSERT INTO issues (id, project_id) VALUES (1, 10), (2, 10), (3, 20), (4, 30)",
        )
        .await;

        let deleted = event_log
            .delete_referencing_rows("issues", "project_id", &[10, 20])
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(count(&event_log, "SELECT COUNT(*) FROM issues").await, 1);
    }

    #[tokio::test]
    async fn test_nullify_references() {
        let event_log = memory_log().await;
        exec(
            &event_log,
            "CREATE TABLE merge_requests (id INTEGER PRIMARY KEY, target_project_id INTEGER)",
        )
        .await;
        exec(
            &event_log,
            "INSERT INTO merge_requests (id, target_project_id) VALUES (1, 10), (2, 20)",
        )
        .await;

        let updated = event_log
            .nullify_references("merge_requests", "target_project_id", &[10])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(
            count(
                &event_log,
                "SELECT COUNT(*) FROM merge_requests WHERE target_project_id IS NULL"
            )
            .await,
            1
        );
        // Rows survive nullification.
        assert_eq!(
            count(&event_log, "SELECT COUNT(*) FROM merge_requests").await,
            2
        );
    }

    #[tokio::test]
    async fn test_cleanup_with_no_keys_is_a_noop() {
        let event_log = memory_log().await;
        assert_eq!(
            event_log
                .delete_referencing_rows("issues", "project_id", &[])
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            event_log
                .nullify_references("issues", "project_id", &[])
                .await
                .unwrap(),
            0
        );
    }
}
