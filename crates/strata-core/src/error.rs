use std::time::Duration;

use thiserror::Error;

use crate::migration::MigrationId;

/// Core error type for strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    DependencyCycle { cycle: Vec<MigrationId> },

    #[error("Migration {migration} depends on unknown migration {dependency}")]
    MissingDependency {
        migration: MigrationId,
        dependency: MigrationId,
    },

    #[error("Migration {0} is defined more than once")]
    DuplicateMigration(MigrationId),

    #[error("Failed to apply migration {migration}, operation #{index} ({operation}): {source}")]
    OperationApply {
        migration: MigrationId,
        index: usize,
        operation: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Operation #{index} ({operation}) in migration {migration} is not reversible")]
    IrreversibleOperation {
        migration: MigrationId,
        index: usize,
        operation: String,
    },

    #[error("Migration lock is held by another process: {0}")]
    ConcurrentApply(String),

    #[error("Operation #{index} in migration {migration} timed out after {elapsed:?}")]
    OperationTimeout {
        migration: MigrationId,
        index: usize,
        elapsed: Duration,
    },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StrataError {
    /// Wrap an error raised while running a single operation.
    pub fn in_operation(
        self,
        migration: &MigrationId,
        index: usize,
        operation: impl Into<String>,
    ) -> Self {
        StrataError::OperationApply {
            migration: migration.clone(),
            index,
            operation: operation.into(),
            source: Box::new(self),
        }
    }
}

fn format_cycle(cycle: &[MigrationId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for StrataError {
    fn from(e: toml::de::Error) -> Self {
        StrataError::Deserialization(e.to_string())
    }
}

impl From<toml::ser::Error> for StrataError {
    fn from(e: toml::ser::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let a = MigrationId::new("yoyaku", "0001_initial");
        let b = MigrationId::new("yoyaku", "0002_auto");
        let err = StrataError::DependencyCycle {
            cycle: vec![a.clone(), b, a],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: yoyaku.0001_initial -> yoyaku.0002_auto -> yoyaku.0001_initial"
        );
    }

    #[test]
    fn test_operation_context_is_preserved() {
        let id = MigrationId::new("yoyaku", "0027_myuser_avatar");
        let err = StrataError::Integrity("boom".into()).in_operation(&id, 0, "Add field avatar to myuser");
        let msg = err.to_string();
        assert!(msg.contains("yoyaku.0027_myuser_avatar"));
        assert!(msg.contains("operation #0"));
        assert!(msg.contains("boom"));
    }
}
