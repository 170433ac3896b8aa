//! PostgreSQL backends.
//!
//! DDL runs inside a transaction per atomic record. The applied set lives in
//! `strata_migrations`, and the batch lock is a session advisory lock held on
//! a dedicated pooled connection so it survives across the batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Transaction};
use strata_core::error::{Result, StrataError};
use strata_core::migration::MigrationId;
use strata_core::schema::{FieldDef, ModelState};
use tracing::debug;
use uuid::Uuid;

use super::{AppliedMigration, AppliedSet, BoxFuture, MigrationLock, SchemaEditor};
use crate::ddl;

const CREATE_LEDGER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS strata_migrations (
        id SERIAL PRIMARY KEY,
        app VARCHAR(255) NOT NULL,
        name VARCHAR(255) NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        run_id UUID,
        UNIQUE (app, name)
    )
"#;

const INSERT_LEDGER_ROW: &str =
    "INSERT INTO strata_migrations (app, name, run_id) VALUES ($1, $2, $3)";

const DELETE_LEDGER_ROW: &str = "DELETE FROM strata_migrations WHERE app = $1 AND name = $2";

/// Schema editor executing rendered DDL against PostgreSQL.
pub struct PgSchemaEditor {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    statement_timeout: Option<Duration>,
    /// Write `strata_migrations` rows in the record's own transaction.
    ledger: bool,
}

impl PgSchemaEditor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: None,
            statement_timeout: None,
            ledger: false,
        }
    }

    /// Keep the `strata_migrations` ledger in the DDL transaction, so a
    /// record's changes and its ledger row commit or roll back together.
    /// Pair with [`PgAppliedSet`] on the same database.
    pub fn with_ledger(mut self, ledger: bool) -> Self {
        self.ledger = ledger;
        self
    }

    /// Server-side timeout applied to statements inside a transaction.
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    async fn run(&mut self, statements: Vec<String>) -> Result<()> {
        for statement in statements {
            debug!(sql = %statement, "Executing DDL");
            let result = match self.tx.as_mut() {
                Some(tx) => sqlx::query(&statement).execute(&mut **tx).await,
                None => sqlx::query(&statement).execute(&self.pool).await,
            };
            result.map_err(|e| {
                StrataError::Database(format!("{} (while executing: {})", e, statement))
            })?;
        }
        Ok(())
    }

    async fn insert_ledger_row(&mut self, id: &MigrationId, run_id: Uuid) -> Result<bool> {
        if !self.ledger {
            return Ok(false);
        }
        let insert = sqlx::query(INSERT_LEDGER_ROW).bind(&id.app).bind(&id.name).bind(run_id);
        let result = match self.tx.as_mut() {
            Some(tx) => {
                sqlx::query(CREATE_LEDGER_TABLE).execute(&mut **tx).await?;
                insert.execute(&mut **tx).await
            }
            None => {
                sqlx::query(CREATE_LEDGER_TABLE).execute(&self.pool).await?;
                insert.execute(&self.pool).await
            }
        };
        result.map_err(|e| StrataError::Database(format!("Failed to record migration '{}': {}", id, e)))?;
        Ok(true)
    }

    async fn delete_ledger_row(&mut self, id: &MigrationId) -> Result<bool> {
        if !self.ledger {
            return Ok(false);
        }
        let delete = sqlx::query(DELETE_LEDGER_ROW).bind(&id.app).bind(&id.name);
        let result = match self.tx.as_mut() {
            Some(tx) => delete.execute(&mut **tx).await,
            None => delete.execute(&self.pool).await,
        };
        result.map_err(|e| StrataError::Database(format!("Failed to unrecord migration '{}': {}", id, e)))?;
        Ok(true)
    }

    async fn begin_tx(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(StrataError::InvalidState(
                "a transaction is already in progress".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        if let Some(timeout) = self.statement_timeout {
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit_tx(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StrataError::InvalidState("no transaction in progress".to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_tx(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

impl SchemaEditor for PgSchemaEditor {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.begin_tx())
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.commit_tx())
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.rollback_tx())
    }

    fn create_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::create_model(model)))
    }

    fn delete_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::delete_model(model)))
    }

    fn rename_model<'a>(&'a mut self, old: &'a ModelState, new: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::rename_model(old, new)))
    }

    fn add_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::add_field(model, field)))
    }

    fn remove_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::remove_field(model, field)))
    }

    fn alter_field<'a>(
        &'a mut self,
        model: &'a ModelState,
        old: &'a FieldDef,
        new: &'a FieldDef,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::alter_field(model, old, new)))
    }

    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.run(ddl::split_sql_statements(sql)))
    }

    fn record_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, bool> {
        Box::pin(self.insert_ledger_row(id, run_id))
    }

    fn record_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, bool> {
        Box::pin(self.delete_ledger_row(id))
    }
}

/// Applied set stored in the `strata_migrations` table.
pub struct PgAppliedSet {
    pool: PgPool,
    table_ready: bool,
}

impl PgAppliedSet {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table_ready: false,
        }
    }

    async fn ensure_table(&mut self) -> Result<()> {
        if self.table_ready {
            return Ok(());
        }
        sqlx::query(CREATE_LEDGER_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to create migrations table: {}", e)))?;
        self.table_ready = true;
        Ok(())
    }

    async fn load_rows(&mut self) -> Result<Vec<AppliedMigration>> {
        self.ensure_table().await?;
        let rows: Vec<(String, String, DateTime<Utc>, Option<Uuid>)> = sqlx::query_as(
            "SELECT app, name, applied_at, run_id FROM strata_migrations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StrataError::Database(format!("Failed to get applied migrations: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(app, name, applied_at, run_id)| AppliedMigration {
                id: MigrationId::new(app, name),
                applied_at,
                run_id,
            })
            .collect())
    }

    async fn insert(&mut self, id: &MigrationId, run_id: Uuid) -> Result<()> {
        self.ensure_table().await?;
        sqlx::query(INSERT_LEDGER_ROW)
            .bind(&id.app)
            .bind(&id.name)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to record migration '{}': {}", id, e)))?;
        Ok(())
    }

    async fn remove(&mut self, id: &MigrationId) -> Result<()> {
        self.ensure_table().await?;
        sqlx::query(DELETE_LEDGER_ROW)
            .bind(&id.app)
            .bind(&id.name)
            .execute(&self.pool)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to unrecord migration '{}': {}", id, e)))?;
        Ok(())
    }
}

impl AppliedSet for PgAppliedSet {
    fn load(&mut self) -> BoxFuture<'_, Vec<AppliedMigration>> {
        Box::pin(self.load_rows())
    }

    fn mark_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, ()> {
        Box::pin(self.insert(id, run_id))
    }

    fn mark_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, ()> {
        Box::pin(self.remove(id))
    }
}

/// Session advisory lock. The connection that took the lock is kept out of
/// the pool until release.
pub struct PgAdvisoryLock {
    pool: PgPool,
    lock_id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool, lock_id: i64) -> Self {
        Self {
            pool,
            lock_id,
            conn: None,
        }
    }

    async fn acquire(&mut self) -> Result<bool> {
        if self.conn.is_some() {
            return Ok(true);
        }
        let mut conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StrataError::Database(format!("Failed to acquire migration lock: {}", e)))?;
        if locked {
            debug!(lock_id = self.lock_id, "Migration lock acquired");
            self.conn = Some(conn);
        }
        Ok(locked)
    }

    async fn unlock(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| StrataError::Database(format!("Failed to release migration lock: {}", e)))?;
            debug!(lock_id = self.lock_id, "Migration lock released");
        }
        Ok(())
    }
}

impl MigrationLock for PgAdvisoryLock {
    fn try_acquire(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.acquire())
    }

    fn release(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.unlock())
    }

    fn describe(&self) -> String {
        format!("advisory lock {}", self.lock_id)
    }
}
