//! Seams between the ledger runner and the outside world.
//!
//! A run needs three collaborators, each injected explicitly:
//! - a [`SchemaEditor`] that turns operations into changes of the target store,
//! - an [`AppliedSet`] that persists which records have been applied,
//! - a [`MigrationLock`] that keeps two processes from applying at once.

mod file;
mod memory;
mod postgres;
mod sql;

pub use file::{FileLock, JsonAppliedSet};
pub use memory::{Column, ForeignKeyRef, LocalLock, MemoryAppliedSet, MemoryDatabase, Row, SchemaSnapshot};
pub use postgres::{PgAdvisoryLock, PgAppliedSet, PgSchemaEditor};
pub use sql::{render_script, SqlCollector};

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::Result;
use strata_core::migration::MigrationId;
use strata_core::schema::{FieldDef, ModelState};
use uuid::Uuid;

/// Boxed future returned by backend trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Applies schema changes to a target store.
///
/// `begin`/`commit`/`rollback` bracket an atomic record. Stores without
/// transactional DDL may treat them as no-ops.
pub trait SchemaEditor: Send {
    fn begin(&mut self) -> BoxFuture<'_, ()>;

    fn commit(&mut self) -> BoxFuture<'_, ()>;

    fn rollback(&mut self) -> BoxFuture<'_, ()>;

    /// Create the model's table and the join tables of its many-to-many fields.
    fn create_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()>;

    /// Drop the model's table and its join tables.
    fn delete_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()>;

    /// Move `old`'s table (and join tables) to `new`'s names.
    fn rename_model<'a>(&'a mut self, old: &'a ModelState, new: &'a ModelState)
        -> BoxFuture<'a, ()>;

    fn add_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef)
        -> BoxFuture<'a, ()>;

    fn remove_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef)
        -> BoxFuture<'a, ()>;

    /// Change a field from `old` to `new`, including renames.
    fn alter_field<'a>(
        &'a mut self,
        model: &'a ModelState,
        old: &'a FieldDef,
        new: &'a FieldDef,
    ) -> BoxFuture<'a, ()>;

    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()>;

    /// Record `id` as applied inside the open transaction, if this editor
    /// keeps the ledger itself. `false` leaves it to the [`AppliedSet`].
    fn record_applied<'a>(&'a mut self, _id: &'a MigrationId, _run_id: Uuid) -> BoxFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    /// Counterpart of [`SchemaEditor::record_applied`] for unapplied records.
    fn record_unapplied<'a>(&'a mut self, _id: &'a MigrationId) -> BoxFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }
}

/// A record that has been applied to a schema instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: MigrationId,
    pub applied_at: DateTime<Utc>,
    /// Run that applied the record.
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

impl AppliedMigration {
    pub fn new(id: MigrationId, run_id: Uuid) -> Self {
        Self {
            id,
            applied_at: Utc::now(),
            run_id: Some(run_id),
        }
    }
}

/// Persisted set of applied record ids.
pub trait AppliedSet: Send {
    /// Applied records in the order they were applied.
    fn load(&mut self) -> BoxFuture<'_, Vec<AppliedMigration>>;

    fn mark_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, ()>;

    fn mark_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, ()>;
}

/// Mutual exclusion around an apply batch.
pub trait MigrationLock: Send {
    /// Try to take the lock without blocking; `false` when another holder has it.
    fn try_acquire(&mut self) -> BoxFuture<'_, bool>;

    fn release(&mut self) -> BoxFuture<'_, ()>;

    /// Where the lock lives, for error messages.
    fn describe(&self) -> String;
}
