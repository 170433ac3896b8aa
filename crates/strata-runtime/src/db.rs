use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use strata_core::config::DatabaseConfig;
use strata_core::error::{Result, StrataError};

/// Connection pool for the target database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    config: DatabaseConfig,
}

impl Database {
    /// Connect using the `[database]` section.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(StrataError::Config(
                "database.url is required for the database backends".to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.config.statement_timeout_secs.map(Duration::from_secs)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_a_config_error() {
        let err = Database::from_config(&DatabaseConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StrataError::Config(_)));
    }
}
