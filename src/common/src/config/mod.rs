use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Connection settings for the store that holds both the deletion log and
/// the child tables it cleans up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Data source name (PostgreSQL or SQLite DSN)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/refsweep.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration for tests and local runs
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// What to do with child rows once their parent row is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// Delete the child rows outright.
    AsyncDelete,
    /// Null out the dangling reference column, keeping the child rows.
    AsyncNullify,
}

/// One child table depending on a parent table through an unenforced
/// foreign key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildRelation {
    /// Child table name
    pub table: String,
    /// Column in the child table holding the parent's primary key
    pub column: String,
    /// Cleanup action applied when the parent row disappears
    pub on_delete: OnDelete,
}

/// All child relations hanging off one parent table, plus an optional
/// batch-size override for its deletion events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationConfig {
    /// Override for the number of deletion events loaded per batch.
    ///
    /// Env: REFSWEEP__SWEEP__RELATIONS__<TABLE>__BATCH_SIZE
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Child relations to clean up when rows of this parent table are deleted.
    pub children: Vec<ChildRelation>,
}

/// Sweep engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Age of the oldest event in the active partition that triggers
    /// opening a new partition.
    ///
    /// Env: REFSWEEP__SWEEP__ROTATION_INTERVAL
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,

    /// How far into the future events are pushed when a cleanup action
    /// fails transiently.
    ///
    /// Env: REFSWEEP__SWEEP__RETRY_BACKOFF
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Batch size used when a relation does not specify its own.
    ///
    /// Env: REFSWEEP__SWEEP__DEFAULT_BATCH_SIZE
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Parent table name -> child relations to clean up.
    #[serde(default)]
    pub relations: HashMap<String, RelationConfig>,
}

fn default_batch_size() -> usize {
    1000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(24 * 3600), // 1 day
            retry_backoff: Duration::from_secs(5 * 60),        // 5 minutes
            default_batch_size: default_batch_size(),
            relations: HashMap::new(),
        }
    }
}

impl SweepConfig {
    /// Validate the sweep configuration.
    ///
    /// Checks:
    /// - Rotation interval and retry backoff are positive
    /// - Batch sizes are positive
    /// - Every relation names at least one child
    /// - Table and column names are plain SQL identifiers
    pub fn validate(&self) -> Result<(), SweepConfigError> {
        let zero = Duration::from_secs(0);

        if self.rotation_interval <= zero {
            return Err(SweepConfigError::InvalidDuration {
                field: "rotation_interval",
                duration: self.rotation_interval,
            });
        }
        if self.retry_backoff <= zero {
            return Err(SweepConfigError::InvalidDuration {
                field: "retry_backoff",
                duration: self.retry_backoff,
            });
        }
        if self.default_batch_size == 0 {
            return Err(SweepConfigError::InvalidBatchSize {
                parent_table: None,
            });
        }

        for (parent_table, relation) in &self.relations {
            if !is_valid_identifier(parent_table) {
                return Err(SweepConfigError::InvalidIdentifier {
                    identifier: parent_table.clone(),
                    role: "parent table",
                });
            }
            if relation.batch_size == Some(0) {
                return Err(SweepConfigError::InvalidBatchSize {
                    parent_table: Some(parent_table.clone()),
                });
            }
            if relation.children.is_empty() {
                return Err(SweepConfigError::NoChildren(parent_table.clone()));
            }
            for child in &relation.children {
                if !is_valid_identifier(&child.table) {
                    return Err(SweepConfigError::InvalidIdentifier {
                        identifier: child.table.clone(),
                        role: "child table",
                    });
                }
                if !is_valid_identifier(&child.column) {
                    return Err(SweepConfigError::InvalidIdentifier {
                        identifier: child.column.clone(),
                        role: "child column",
                    });
                }
            }
        }

        Ok(())
    }
}

/// Check that a name is usable as an unquoted, optionally schema-qualified
/// SQL identifier. Everything interpolated into cleanup SQL must pass this.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Errors that can occur during sweep configuration validation.
#[derive(Error, Debug)]
pub enum SweepConfigError {
    /// A duration field must be positive.
    #[error("Invalid {field}: {duration:?} must be positive")]
    InvalidDuration {
        field: &'static str,
        duration: Duration,
    },

    /// Batch sizes must be positive.
    #[error("Invalid batch size for {}", parent_table.as_deref().unwrap_or("default_batch_size"))]
    InvalidBatchSize { parent_table: Option<String> },

    /// A relation with no children cleans up nothing.
    #[error("Relation '{0}' declares no child tables")]
    NoChildren(String),

    /// A table or column name that cannot be safely interpolated into SQL.
    #[error("Invalid {role} identifier: '{identifier}'")]
    InvalidIdentifier { identifier: String, role: &'static str },
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Database configuration (deletion log and child tables)
    pub database: DatabaseConfig,
    /// Sweep engine configuration
    pub sweep: SweepConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("refsweep.toml"))
            .merge(Env::prefixed("REFSWEEP__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        log::info!("Loading configuration from: {}", path.display());
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("REFSWEEP__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();

        assert_eq!(config.database.dsn, "sqlite://.data/refsweep.db");
        assert_eq!(
            config.sweep.rotation_interval,
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(config.sweep.retry_backoff, Duration::from_secs(300));
        assert_eq!(config.sweep.default_batch_size, 1000);
        assert!(config.sweep.relations.is_empty());
        assert!(config.sweep.validate().is_ok());
    }

    #[test]
    fn test_zero_rotation_interval_is_invalid() {
        let config = SweepConfig {
            rotation_interval: Duration::from_secs(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let config = SweepConfig {
            default_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relation_without_children_is_invalid() {
        let mut config = SweepConfig::default();
        config.relations.insert(
            "projects".to_string(),
            RelationConfig {
                batch_size: None,
                children: vec![],
            },
        );
        assert!(matches!(
            config.validate(),
            Err(SweepConfigError::NoChildren(_))
        ));
    }

    #[test]
    fn test_hostile_identifier_is_rejected() {
        let mut config = SweepConfig::default();
        config.relations.insert(
            "projects".to_string(),
            RelationConfig {
                batch_size: None,
                children: vec![ChildRelation {
                    table: "issues; DROP TABLE users".to_string(),
                    column: "project_id".to_string(),
                    on_delete: OnDelete::AsyncDelete,
                }],
            },
        );
        assert!(matches!(
            config.validate(),
            Err(SweepConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("issues"));
        assert!(is_valid_identifier("public.issues"));
        assert!(is_valid_identifier("_internal_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("a..b"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier("a b"));
    }

    #[test]
    fn test_toml_relations_parse() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "refsweep.toml",
                r#"
                [database]
                dsn = "sqlite::memory:"

                [sweep]
                rotation_interval = "1day"
                retry_backoff = "10m"
                default_batch_size = 500

                [sweep.relations.projects]
                batch_size = 250

                [[sweep.relations.projects.children]]
                table = "issues"
                column = "project_id"
                on_delete = "async_delete"

                [[sweep.relations.projects.children]]
                table = "merge_requests"
                column = "target_project_id"
                on_delete = "async_nullify"
                "#,
            )?;

            let config: Configuration =
                Figment::from(Serialized::defaults(Configuration::default()))
                    .merge(Toml::file("refsweep.toml"))
                    .extract()?;

            assert_eq!(config.database.dsn, "sqlite::memory:");
            assert_eq!(config.sweep.retry_backoff, Duration::from_secs(600));
            assert_eq!(config.sweep.default_batch_size, 500);

            let relation = config.sweep.relations.get("projects").unwrap();
            assert_eq!(relation.batch_size, Some(250));
            assert_eq!(relation.children.len(), 2);
            assert_eq!(relation.children[0].on_delete, OnDelete::AsyncDelete);
            assert_eq!(relation.children[1].on_delete, OnDelete::AsyncNullify);
            assert!(config.sweep.validate().is_ok());

            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("REFSWEEP__DATABASE__DSN", "sqlite://./override.db");
            jail.set_env("REFSWEEP__SWEEP__DEFAULT_BATCH_SIZE", "42");

            let config: Configuration =
                Figment::from(Serialized::defaults(Configuration::default()))
                    .merge(Env::prefixed("REFSWEEP__").split("__"))
                    .extract()?;

            assert_eq!(config.database.dsn, "sqlite://./override.db");
            assert_eq!(config.sweep.default_batch_size, 42);

            Ok(())
        });
    }
}
