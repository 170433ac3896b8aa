//! Ledger applier.
//!
//! Applies pending records in dependency order under an exclusive lock,
//! recording each record only after all of its operations succeeded.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use strata_core::config::MigrationsConfig;
use strata_core::error::{Result, StrataError};
use strata_core::migration::{MigrationGraph, MigrationId, MigrationRecord, Operation};
use strata_core::schema::ProjectState;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{AppliedMigration, AppliedSet, MigrationLock, SchemaEditor, SqlCollector};
use crate::plan::{Direction, MigrationPlan, MigrationTarget};

/// Runtime knobs of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Only update the applied set; leave the schema alone.
    pub fake: bool,
    /// How long to keep polling a held lock.
    pub lock_wait: Duration,
    pub lock_poll_interval: Duration,
    /// Per-operation limit; exceeding it aborts the batch.
    pub operation_timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            fake: false,
            lock_wait: Duration::ZERO,
            lock_poll_interval: Duration::from_millis(500),
            operation_timeout: None,
        }
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &MigrationsConfig) -> Self {
        Self {
            fake: false,
            lock_wait: config.lock_wait(),
            lock_poll_interval: config.lock_poll_interval(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Summary of one `migrate` or `rollback_last` call.
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    pub run_id: Uuid,
    pub applied: Vec<MigrationId>,
    pub unapplied: Vec<MigrationId>,
    /// Records that were already applied and left untouched.
    pub skipped: usize,
    pub elapsed: Duration,
    pub fake: bool,
}

impl MigrationRunResult {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.unapplied.is_empty()
    }
}

/// Applied/pending view of a graph.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// Applied records known to the graph, in graph order.
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<MigrationId>,
    /// Applied records with no definition on disk.
    pub unknown: Vec<AppliedMigration>,
}

/// Applies and reverts migration records.
pub struct MigrationExecutor {
    editor: Box<dyn SchemaEditor>,
    applied: Box<dyn AppliedSet>,
    lock: Box<dyn MigrationLock>,
    options: ExecutorOptions,
}

impl MigrationExecutor {
    pub fn new(
        editor: impl SchemaEditor + 'static,
        applied: impl AppliedSet + 'static,
        lock: impl MigrationLock + 'static,
    ) -> Self {
        Self::from_boxed(Box::new(editor), Box::new(applied), Box::new(lock))
    }

    pub fn from_boxed(
        editor: Box<dyn SchemaEditor>,
        applied: Box<dyn AppliedSet>,
        lock: Box<dyn MigrationLock>,
    ) -> Self {
        Self {
            editor,
            applied,
            lock,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_fake(&mut self, fake: bool) {
        self.options.fake = fake;
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub async fn applied_ids(&mut self) -> Result<HashSet<MigrationId>> {
        Ok(self
            .applied
            .load()
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect())
    }

    /// Steps `migrate` would run for `target`, without taking the lock.
    pub async fn plan(&mut self, graph: &MigrationGraph, target: &MigrationTarget) -> Result<MigrationPlan> {
        let applied = self.applied_ids().await?;
        MigrationPlan::build(graph, &applied, target)
    }

    /// Move the schema to `target`.
    pub async fn migrate(
        &mut self,
        graph: &MigrationGraph,
        target: &MigrationTarget,
    ) -> Result<MigrationRunResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("migrate", %run_id, %target);
        async {
            self.acquire_lock().await?;
            let result = self.migrate_inner(graph, target, run_id).await;
            self.release_lock().await;
            result
        }
        .instrument(span)
        .await
    }

    /// Unapply the `count` most recent records.
    pub async fn rollback_last(
        &mut self,
        graph: &MigrationGraph,
        count: usize,
    ) -> Result<MigrationRunResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("rollback", %run_id, count);
        async {
            self.acquire_lock().await?;
            let result = async {
                let applied = self.applied_ids().await?;
                let plan = MigrationPlan::rollback_last(graph, &applied, count);
                self.execute(graph, plan, applied, run_id).await
            }
            .await;
            self.release_lock().await;
            result
        }
        .instrument(span)
        .await
    }

    pub async fn status(&mut self, graph: &MigrationGraph) -> Result<MigrationStatus> {
        let entries = self.applied.load().await?;
        let ids: HashSet<&MigrationId> = entries.iter().map(|a| &a.id).collect();

        let pending = graph
            .topological_order()
            .iter()
            .filter(|id| !ids.contains(id))
            .cloned()
            .collect();

        let (mut applied, unknown): (Vec<_>, Vec<_>) = entries
            .iter()
            .cloned()
            .partition(|a| graph.contains(&a.id));
        applied.sort_by_key(|a| graph.position(&a.id));

        Ok(MigrationStatus {
            applied,
            pending,
            unknown,
        })
    }

    async fn migrate_inner(
        &mut self,
        graph: &MigrationGraph,
        target: &MigrationTarget,
        run_id: Uuid,
    ) -> Result<MigrationRunResult> {
        let applied = self.applied_ids().await?;
        let plan = MigrationPlan::build(graph, &applied, target)?;
        self.execute(graph, plan, applied, run_id).await
    }

    async fn acquire_lock(&mut self) -> Result<()> {
        debug!("Acquiring migration lock...");
        let deadline = Instant::now() + self.options.lock_wait;
        loop {
            if self.lock.try_acquire().await? {
                debug!("Migration lock acquired");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StrataError::ConcurrentApply(self.lock.describe()));
            }
            debug!("Migration lock busy, retrying in {:?}", self.options.lock_poll_interval);
            tokio::time::sleep(self.options.lock_poll_interval).await;
        }
    }

    async fn release_lock(&mut self) {
        if let Err(e) = self.lock.release().await {
            warn!("Failed to release migration lock: {}", e);
        }
    }

    async fn execute(
        &mut self,
        graph: &MigrationGraph,
        plan: MigrationPlan,
        mut applied: HashSet<MigrationId>,
        run_id: Uuid,
    ) -> Result<MigrationRunResult> {
        let started = Instant::now();
        let known_applied = graph.records().filter(|r| applied.contains(&r.id)).count();
        let mut result = MigrationRunResult {
            run_id,
            applied: Vec::new(),
            unapplied: Vec::new(),
            skipped: known_applied - plan.backwards().count(),
            elapsed: Duration::ZERO,
            fake: self.options.fake,
        };

        if plan.is_empty() {
            info!("No migrations to apply");
            return Ok(result);
        }
        if !self.options.fake {
            check_reversible(graph, &plan)?;
        }

        for step in &plan.steps {
            let record = graph.record(&step.id)?;
            let position = graph.position(&step.id);
            let before = graph.make_state(|id| applied.contains(id) && graph.position(id) < position)?;

            match step.direction {
                Direction::Forwards => {
                    self.apply_record(record, before, run_id).await?;
                    applied.insert(step.id.clone());
                    result.applied.push(step.id.clone());
                }
                Direction::Backwards => {
                    self.unapply_record(record, before, run_id).await?;
                    applied.remove(&step.id);
                    result.unapplied.push(step.id.clone());
                }
            }
        }

        result.elapsed = started.elapsed();
        info!(
            applied = result.applied.len(),
            unapplied = result.unapplied.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Migration run complete"
        );
        Ok(result)
    }

    async fn apply_record(&mut self, record: &MigrationRecord, before: ProjectState, run_id: Uuid) -> Result<()> {
        if self.options.fake {
            self.applied.mark_applied(&record.id, run_id).await?;
            info!(migration = %record.id, "Marked migration as applied (fake)");
            return Ok(());
        }

        info!(migration = %record.id, "Applying migration");
        let started = Instant::now();
        run_record(
            self.editor.as_mut(),
            record,
            before,
            Direction::Forwards,
            self.options.operation_timeout,
        )
        .await?;
        self.finish_record(record, Direction::Forwards, run_id).await?;
        info!(
            migration = %record.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration applied"
        );
        Ok(())
    }

    async fn unapply_record(&mut self, record: &MigrationRecord, before: ProjectState, run_id: Uuid) -> Result<()> {
        if self.options.fake {
            self.applied.mark_unapplied(&record.id).await?;
            info!(migration = %record.id, "Marked migration as unapplied (fake)");
            return Ok(());
        }

        info!(migration = %record.id, "Unapplying migration");
        run_record(
            self.editor.as_mut(),
            record,
            before,
            Direction::Backwards,
            self.options.operation_timeout,
        )
        .await?;
        self.finish_record(record, Direction::Backwards, run_id).await?;
        info!(migration = %record.id, "Migration unapplied");
        Ok(())
    }

    /// Update the ledger, then commit an atomic record. The ledger write is
    /// part of the record's unit: if it fails the record is rolled back, and
    /// if the commit fails the ledger write is reverted.
    async fn finish_record(&mut self, record: &MigrationRecord, direction: Direction, run_id: Uuid) -> Result<()> {
        let in_editor = match self.record_outcome(&record.id, direction, run_id).await {
            Ok(in_editor) => in_editor,
            Err(e) => {
                error!(migration = %record.id, "Failed to update applied set: {}", e);
                if record.atomic {
                    if let Err(rollback) = self.editor.rollback().await {
                        warn!(migration = %record.id, "Failed to roll back: {}", rollback);
                    }
                } else {
                    warn!(
                        migration = %record.id,
                        "Non-atomic migration ran but could not be recorded; inspect the store before retrying"
                    );
                }
                return Err(e);
            }
        };

        if record.atomic {
            if let Err(e) = self.editor.commit().await {
                error!(migration = %record.id, "Failed to commit: {}", e);
                if !in_editor {
                    self.revert_outcome(&record.id, direction, run_id).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// `true` when the editor wrote the ledger inside its own transaction.
    async fn record_outcome(&mut self, id: &MigrationId, direction: Direction, run_id: Uuid) -> Result<bool> {
        match direction {
            Direction::Forwards => {
                if self.editor.record_applied(id, run_id).await? {
                    return Ok(true);
                }
                self.applied.mark_applied(id, run_id).await?;
            }
            Direction::Backwards => {
                if self.editor.record_unapplied(id).await? {
                    return Ok(true);
                }
                self.applied.mark_unapplied(id).await?;
            }
        }
        Ok(false)
    }

    async fn revert_outcome(&mut self, id: &MigrationId, direction: Direction, run_id: Uuid) {
        let reverted = match direction {
            Direction::Forwards => self.applied.mark_unapplied(id).await,
            Direction::Backwards => self.applied.mark_applied(id, run_id).await,
        };
        if let Err(e) = reverted {
            warn!(migration = %id, "Failed to revert applied set: {}", e);
        }
    }
}

/// DDL a record would run, forwards or backwards, on top of its ancestors.
pub async fn collect_sql(graph: &MigrationGraph, id: &MigrationId, backwards: bool) -> Result<Vec<String>> {
    let record = graph.record(id)?;
    if backwards {
        if let Some((index, op)) = first_irreversible(record) {
            return Err(StrataError::IrreversibleOperation {
                migration: id.clone(),
                index,
                operation: op.describe(),
            });
        }
    }

    let ancestors = graph.ancestors(id);
    let before = graph.make_state(|other| ancestors.contains(other))?;
    let direction = if backwards {
        Direction::Backwards
    } else {
        Direction::Forwards
    };

    let mut collector = SqlCollector::new();
    run_record(&mut collector, record, before, direction, None).await?;
    if record.atomic {
        collector.commit().await?;
    }
    Ok(collector.into_statements())
}

fn first_irreversible(record: &MigrationRecord) -> Option<(usize, &Operation)> {
    record
        .operations
        .iter()
        .enumerate()
        .find(|(_, op)| !op.is_reversible())
}

fn check_reversible(graph: &MigrationGraph, plan: &MigrationPlan) -> Result<()> {
    for id in plan.backwards() {
        let record = graph.record(id)?;
        if let Some((index, op)) = first_irreversible(record) {
            return Err(StrataError::IrreversibleOperation {
                migration: id.clone(),
                index,
                operation: op.describe(),
            });
        }
    }
    Ok(())
}

/// Run every operation of a record against `editor`.
///
/// `before` is the project state the record starts from. Atomic records run
/// after `begin` and are rolled back on failure; on success the transaction
/// is left open for the caller to record the outcome and commit.
async fn run_record(
    editor: &mut dyn SchemaEditor,
    record: &MigrationRecord,
    before: ProjectState,
    direction: Direction,
    timeout: Option<Duration>,
) -> Result<()> {
    let app = record.app();

    // states[i] is the state operation i starts from.
    let mut states = Vec::with_capacity(record.operations.len() + 1);
    let mut state = before;
    for (index, op) in record.operations.iter().enumerate() {
        let mut next = state.clone();
        op.state_forwards(app, &mut next)
            .map_err(|e| e.in_operation(&record.id, index, op.describe()))?;
        states.push(state);
        state = next;
    }
    states.push(state);

    if record.atomic {
        editor.begin().await?;
    }

    let indices: Vec<usize> = match direction {
        Direction::Forwards => (0..record.operations.len()).collect(),
        Direction::Backwards => (0..record.operations.len()).rev().collect(),
    };

    for index in indices {
        let op = &record.operations[index];
        let (from, to) = (&states[index], &states[index + 1]);
        debug!(migration = %record.id, index, operation = %op.describe(), "Running operation");

        let work = async {
            match direction {
                Direction::Forwards => database_forwards(&mut *editor, op, app, from, to).await,
                Direction::Backwards => database_backwards(&mut *editor, op, app, from, to).await,
            }
        };
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                Err(StrataError::OperationTimeout {
                    migration: record.id.clone(),
                    index,
                    elapsed: limit,
                })
            }),
            None => work.await,
        };

        if let Err(e) = outcome {
            error!(migration = %record.id, index, "Operation failed: {}", e);
            if record.atomic {
                if let Err(rollback) = editor.rollback().await {
                    warn!(migration = %record.id, "Failed to roll back: {}", rollback);
                }
            } else if index > 0 {
                warn!(
                    migration = %record.id,
                    "Non-atomic migration failed part-way; earlier operations remain in place"
                );
            }
            return Err(match e {
                timeout @ StrataError::OperationTimeout { .. } => timeout,
                other => other.in_operation(&record.id, index, op.describe()),
            });
        }
    }
    Ok(())
}

async fn database_forwards(
    editor: &mut dyn SchemaEditor,
    op: &Operation,
    app: &str,
    from: &ProjectState,
    to: &ProjectState,
) -> Result<()> {
    match op {
        Operation::CreateModel { name, .. } => editor.create_model(to.model(app, name)?).await,
        Operation::DeleteModel { name } => editor.delete_model(from.model(app, name)?).await,
        Operation::RenameModel { old_name, new_name } => {
            editor
                .rename_model(from.model(app, old_name)?, to.model(app, new_name)?)
                .await
        }
        Operation::AddField { model_name, field } => {
            let model = to.model(app, model_name)?;
            editor.add_field(model, model.get_field(&field.name)?).await
        }
        Operation::RemoveField { model_name, name } => {
            let model = from.model(app, model_name)?;
            editor.remove_field(model, model.get_field(name)?).await
        }
        Operation::AlterField { model_name, field } => {
            let old = from.model(app, model_name)?.get_field(&field.name)?;
            let model = to.model(app, model_name)?;
            editor.alter_field(model, old, model.get_field(&field.name)?).await
        }
        Operation::RenameField {
            model_name,
            old_name,
            new_name,
        } => {
            let old = from.model(app, model_name)?.get_field(old_name)?;
            let model = to.model(app, model_name)?;
            editor.alter_field(model, old, model.get_field(new_name)?).await
        }
        Operation::RunSql { sql, .. } => editor.execute_sql(sql).await,
    }
}

async fn database_backwards(
    editor: &mut dyn SchemaEditor,
    op: &Operation,
    app: &str,
    from: &ProjectState,
    to: &ProjectState,
) -> Result<()> {
    match op {
        Operation::CreateModel { name, .. } => editor.delete_model(to.model(app, name)?).await,
        Operation::DeleteModel { name } => editor.create_model(from.model(app, name)?).await,
        Operation::RenameModel { old_name, new_name } => {
            editor
                .rename_model(to.model(app, new_name)?, from.model(app, old_name)?)
                .await
        }
        Operation::AddField { model_name, field } => {
            let model = to.model(app, model_name)?;
            editor.remove_field(model, model.get_field(&field.name)?).await
        }
        Operation::RemoveField { model_name, name } => {
            let model = from.model(app, model_name)?;
            editor.add_field(model, model.get_field(name)?).await
        }
        Operation::AlterField { model_name, field } => {
            let current = to.model(app, model_name)?.get_field(&field.name)?;
            let model = from.model(app, model_name)?;
            editor.alter_field(model, current, model.get_field(&field.name)?).await
        }
        Operation::RenameField {
            model_name,
            old_name,
            new_name,
        } => {
            let current = to.model(app, model_name)?.get_field(new_name)?;
            let model = from.model(app, model_name)?;
            editor.alter_field(model, current, model.get_field(old_name)?).await
        }
        Operation::RunSql { reverse_sql, .. } => match reverse_sql {
            Some(sql) => editor.execute_sql(sql).await,
            None => Err(StrataError::InvalidState(
                "RunSql without reverse_sql cannot be unapplied".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, LocalLock, MemoryAppliedSet, MemoryDatabase};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use strata_core::schema::{FieldDef, FieldKind, OnDelete};

    fn preschool_graph() -> MigrationGraph {
        MigrationGraph::new([
            MigrationRecord::new("yoyaku", "0001_initial").initial().operation(Operation::CreateModel {
                name: "StudentProfile".into(),
                fields: vec![FieldDef::new("name", FieldKind::Char { max_length: 100 })],
            }),
            MigrationRecord::new("yoyaku", "0002_preschoolclass")
                .depends_on("yoyaku", "0001_initial")
                .operation(Operation::CreateModel {
                    name: "PreschoolClass".into(),
                    fields: vec![FieldDef::new("limit", FieldKind::Integer)],
                })
                .operation(Operation::AddField {
                    model_name: "StudentProfile".into(),
                    field: FieldDef::new(
                        "preschool",
                        FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
                    )
                    .nullable(),
                }),
        ])
        .unwrap()
    }

    struct Harness {
        db: MemoryDatabase,
        applied: MemoryAppliedSet,
        lock: LocalLock,
        executor: MigrationExecutor,
    }

    fn harness() -> Harness {
        let db = MemoryDatabase::new();
        let applied = MemoryAppliedSet::new();
        let lock = LocalLock::new();
        let executor = MigrationExecutor::new(db.clone(), applied.clone(), lock.handle());
        Harness {
            db,
            applied,
            lock,
            executor,
        }
    }

    #[tokio::test]
    async fn test_migrate_latest_then_noop() {
        let graph = preschool_graph();
        let mut h = harness();

        let first = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert_eq!(first.applied.len(), 2);
        assert!(h.db.has_table("yoyaku_preschoolclass"));
        assert!(h.db.column("yoyaku_studentprofile", "preschool_id").is_some());
        assert!(!h.lock.is_locked());

        let snapshot = h.db.schema();
        let second = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.skipped, 2);
        assert_eq!(h.db.schema(), snapshot);
    }

    #[tokio::test]
    async fn test_migrate_to_zero_restores_empty_schema() {
        let graph = preschool_graph();
        let mut h = harness();
        h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();

        let result = h
            .executor
            .migrate(&graph, &MigrationTarget::Zero("yoyaku".into()))
            .await
            .unwrap();
        assert_eq!(
            result.unapplied,
            vec![
                MigrationId::new("yoyaku", "0002_preschoolclass"),
                MigrationId::new("yoyaku", "0001_initial"),
            ]
        );
        assert!(h.db.table_names().is_empty());
        assert!(h.applied.ids().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_is_a_concurrent_apply_error() {
        let graph = preschool_graph();
        let mut h = harness();
        let mut other = h.lock.handle();
        assert!(other.try_acquire().await.unwrap());

        let err = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap_err();
        assert!(matches!(err, StrataError::ConcurrentApply(_)));
        assert!(h.db.table_names().is_empty());
        assert!(h.applied.ids().is_empty());
    }

    #[tokio::test]
    async fn test_lock_wait_polls_until_released() {
        let graph = preschool_graph();
        let mut h = harness();
        h.executor = MigrationExecutor::new(h.db.clone(), h.applied.clone(), h.lock.handle()).with_options(
            ExecutorOptions {
                lock_wait: Duration::from_secs(5),
                lock_poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let mut other = h.lock.handle();
        assert!(other.try_acquire().await.unwrap());
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            other.release().await.unwrap();
        });

        let result = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert_eq!(result.applied.len(), 2);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_fake_marks_without_touching_schema() {
        let graph = preschool_graph();
        let mut h = harness();
        h.executor.set_fake(true);

        let result = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert!(result.fake);
        assert_eq!(h.applied.ids().len(), 2);
        assert!(h.db.table_names().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_uses_pre_image_of_altered_field() {
        let graph = MigrationGraph::new([
            MigrationRecord::new("yoyaku", "0001_initial").initial().operation(Operation::CreateModel {
                name: "PreschoolClass".into(),
                fields: vec![FieldDef::new("name", FieldKind::Char { max_length: 300 })],
            }),
            MigrationRecord::new("yoyaku", "0002_alter_name")
                .depends_on("yoyaku", "0001_initial")
                .operation(Operation::AlterField {
                    model_name: "PreschoolClass".into(),
                    field: FieldDef::new("name", FieldKind::Text).blank(),
                }),
        ])
        .unwrap();
        let mut h = harness();
        h.executor
            .migrate(&graph, &MigrationTarget::To(MigrationId::new("yoyaku", "0001_initial")))
            .await
            .unwrap();
        let before = h.db.schema();

        h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert_ne!(h.db.schema(), before);

        let result = h.executor.rollback_last(&graph, 1).await.unwrap();
        assert_eq!(result.unapplied, vec![MigrationId::new("yoyaku", "0002_alter_name")]);
        assert_eq!(h.db.schema(), before);
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        struct SlowEditor;

        impl SchemaEditor for SlowEditor {
            fn begin(&mut self) -> crate::backend::BoxFuture<'_, ()> {
                Box::pin(async { Ok(()) })
            }
            fn commit(&mut self) -> crate::backend::BoxFuture<'_, ()> {
                Box::pin(async { Ok(()) })
            }
            fn rollback(&mut self) -> crate::backend::BoxFuture<'_, ()> {
                Box::pin(async { Ok(()) })
            }
            fn create_model<'a>(&'a mut self, _: &'a strata_core::ModelState) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
            }
            fn delete_model<'a>(&'a mut self, _: &'a strata_core::ModelState) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn rename_model<'a>(
                &'a mut self,
                _: &'a strata_core::ModelState,
                _: &'a strata_core::ModelState,
            ) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn add_field<'a>(&'a mut self, _: &'a strata_core::ModelState, _: &'a FieldDef) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn remove_field<'a>(&'a mut self, _: &'a strata_core::ModelState, _: &'a FieldDef) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn alter_field<'a>(
                &'a mut self,
                _: &'a strata_core::ModelState,
                _: &'a FieldDef,
                _: &'a FieldDef,
            ) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn execute_sql<'a>(&'a mut self, _: &'a str) -> crate::backend::BoxFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
        }

        let graph = preschool_graph();
        let applied = MemoryAppliedSet::new();
        let mut executor = MigrationExecutor::new(SlowEditor, applied.clone(), LocalLock::new()).with_options(
            ExecutorOptions {
                operation_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );

        let err = executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap_err();
        match err {
            StrataError::OperationTimeout { migration, index, .. } => {
                assert_eq!(migration, MigrationId::new("yoyaku", "0001_initial"));
                assert_eq!(index, 0);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(applied.ids().is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let graph = preschool_graph();
        let mut h = harness();
        h.executor
            .migrate(&graph, &MigrationTarget::To(MigrationId::new("yoyaku", "0001_initial")))
            .await
            .unwrap();
        let mut stray = h.applied.clone();
        stray
            .mark_applied(&MigrationId::new("legacy", "0001_initial"), Uuid::new_v4())
            .await
            .unwrap();

        let status = h.executor.status(&graph).await.unwrap();
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.pending, vec![MigrationId::new("yoyaku", "0002_preschoolclass")]);
        assert_eq!(status.unknown.len(), 1);
    }

    #[tokio::test]
    async fn test_collect_sql() {
        let graph = preschool_graph();
        let id = MigrationId::new("yoyaku", "0002_preschoolclass");

        let forwards = collect_sql(&graph, &id, false).await.unwrap();
        assert_eq!(forwards.first().map(String::as_str), Some("BEGIN"));
        assert!(forwards[1].starts_with("CREATE TABLE \"yoyaku_preschoolclass\""));
        assert!(forwards[2].contains("ADD COLUMN \"preschool_id\" INTEGER"));

        let backwards = collect_sql(&graph, &id, true).await.unwrap();
        assert_eq!(
            backwards[1..3],
            [
                "ALTER TABLE \"yoyaku_studentprofile\" DROP COLUMN \"preschool_id\" CASCADE".to_string(),
                "DROP TABLE \"yoyaku_preschoolclass\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_rows_survive_forward_migration() {
        let graph = preschool_graph();
        let mut h = harness();
        h.executor
            .migrate(&graph, &MigrationTarget::To(MigrationId::new("yoyaku", "0001_initial")))
            .await
            .unwrap();
        let kid = h.db.insert("yoyaku_studentprofile", json!({"name": "Hana"})).unwrap();

        h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        let row = h.db.get("yoyaku_studentprofile", kid).unwrap();
        assert_eq!(row["preschool_id"], serde_json::Value::Null);
        assert_eq!(row["name"], json!("Hana"));
    }

    /// Applied set whose next mark or unmark fails once.
    #[derive(Clone, Default)]
    struct FlakyAppliedSet {
        inner: MemoryAppliedSet,
        fail_mark: Arc<AtomicBool>,
        fail_unmark: Arc<AtomicBool>,
    }

    fn connection_reset<'a>() -> BoxFuture<'a, ()> {
        Box::pin(async { Err(StrataError::Database("connection reset".to_string())) })
    }

    impl AppliedSet for FlakyAppliedSet {
        fn load(&mut self) -> BoxFuture<'_, Vec<AppliedMigration>> {
            self.inner.load()
        }

        fn mark_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, ()> {
            if self.fail_mark.swap(false, Ordering::SeqCst) {
                return connection_reset();
            }
            self.inner.mark_applied(id, run_id)
        }

        fn mark_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, ()> {
            if self.fail_unmark.swap(false, Ordering::SeqCst) {
                return connection_reset();
            }
            self.inner.mark_unapplied(id)
        }
    }

    #[tokio::test]
    async fn test_failed_mark_rolls_back_the_record() {
        let graph = preschool_graph();
        let db = MemoryDatabase::new();
        let applied = FlakyAppliedSet::default();
        applied.fail_mark.store(true, Ordering::SeqCst);
        let mut executor = MigrationExecutor::new(db.clone(), applied.clone(), LocalLock::new());

        let err = executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap_err();
        assert!(matches!(err, StrataError::Database(_)));
        assert!(db.table_names().is_empty());
        assert!(!db.in_transaction());
        assert!(applied.inner.ids().is_empty());

        let retry = executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert_eq!(retry.applied.len(), 2);
        assert!(db.has_table("yoyaku_preschoolclass"));
        assert_eq!(applied.inner.ids().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_unmark_keeps_the_record_applied() {
        let graph = preschool_graph();
        let db = MemoryDatabase::new();
        let applied = FlakyAppliedSet::default();
        let mut executor = MigrationExecutor::new(db.clone(), applied.clone(), LocalLock::new());
        executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        let snapshot = db.schema();

        applied.fail_unmark.store(true, Ordering::SeqCst);
        let err = executor.rollback_last(&graph, 1).await.unwrap_err();
        assert!(matches!(err, StrataError::Database(_)));
        assert_eq!(db.schema(), snapshot);
        assert!(applied.inner.contains(&MigrationId::new("yoyaku", "0002_preschoolclass")));

        let retry = executor.rollback_last(&graph, 1).await.unwrap();
        assert_eq!(retry.unapplied, vec![MigrationId::new("yoyaku", "0002_preschoolclass")]);
        assert!(!db.has_table("yoyaku_preschoolclass"));
        assert_eq!(applied.inner.ids(), vec![MigrationId::new("yoyaku", "0001_initial")]);
    }

    #[tokio::test]
    async fn test_non_atomic_failure_keeps_earlier_operations() {
        let details = MigrationId::new("yoyaku", "0002_profile_details");
        let graph = MigrationGraph::new([
            MigrationRecord::new("yoyaku", "0001_initial").initial().operation(Operation::CreateModel {
                name: "StudentProfile".into(),
                fields: vec![FieldDef::new("name", FieldKind::Char { max_length: 100 })],
            }),
            MigrationRecord::new("yoyaku", "0002_profile_details")
                .depends_on("yoyaku", "0001_initial")
                .non_atomic()
                .operation(Operation::AddField {
                    model_name: "StudentProfile".into(),
                    field: FieldDef::new("nickname", FieldKind::Char { max_length: 50 }).nullable(),
                })
                .operation(Operation::AddField {
                    model_name: "StudentProfile".into(),
                    field: FieldDef::new("grade", FieldKind::Integer),
                }),
        ])
        .unwrap();
        let mut h = harness();
        h.executor
            .migrate(&graph, &MigrationTarget::To(MigrationId::new("yoyaku", "0001_initial")))
            .await
            .unwrap();
        h.db.insert("yoyaku_studentprofile", json!({"name": "Hana"})).unwrap();

        let err = h.executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap_err();
        match err {
            StrataError::OperationApply { migration, index, .. } => {
                assert_eq!(migration, details);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(h.db.column("yoyaku_studentprofile", "nickname").is_some());
        assert!(h.db.column("yoyaku_studentprofile", "grade").is_none());
        assert!(!h.db.in_transaction());
        assert!(!h.applied.contains(&details));
        assert!(h.applied.contains(&MigrationId::new("yoyaku", "0001_initial")));
    }

    /// Memory store that keeps its own ledger inside each transaction.
    struct LedgerEditor {
        db: MemoryDatabase,
        ledger: MemoryAppliedSet,
    }

    impl SchemaEditor for LedgerEditor {
        fn begin(&mut self) -> BoxFuture<'_, ()> {
            self.db.begin()
        }
        fn commit(&mut self) -> BoxFuture<'_, ()> {
            self.db.commit()
        }
        fn rollback(&mut self) -> BoxFuture<'_, ()> {
            self.db.rollback()
        }
        fn create_model<'a>(&'a mut self, model: &'a strata_core::ModelState) -> BoxFuture<'a, ()> {
            self.db.create_model(model)
        }
        fn delete_model<'a>(&'a mut self, model: &'a strata_core::ModelState) -> BoxFuture<'a, ()> {
            self.db.delete_model(model)
        }
        fn rename_model<'a>(
            &'a mut self,
            old: &'a strata_core::ModelState,
            new: &'a strata_core::ModelState,
        ) -> BoxFuture<'a, ()> {
            self.db.rename_model(old, new)
        }
        fn add_field<'a>(&'a mut self, model: &'a strata_core::ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
            self.db.add_field(model, field)
        }
        fn remove_field<'a>(&'a mut self, model: &'a strata_core::ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
            self.db.remove_field(model, field)
        }
        fn alter_field<'a>(
            &'a mut self,
            model: &'a strata_core::ModelState,
            old: &'a FieldDef,
            new: &'a FieldDef,
        ) -> BoxFuture<'a, ()> {
            self.db.alter_field(model, old, new)
        }
        fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()> {
            self.db.execute_sql(sql)
        }
        fn record_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, bool> {
            Box::pin(async move {
                self.ledger.mark_applied(id, run_id).await?;
                Ok(true)
            })
        }
        fn record_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, bool> {
            Box::pin(async move {
                self.ledger.mark_unapplied(id).await?;
                Ok(true)
            })
        }
    }

    #[tokio::test]
    async fn test_editor_ledger_replaces_applied_set_writes() {
        let graph = preschool_graph();
        let db = MemoryDatabase::new();
        let ledger = MemoryAppliedSet::new();
        let applied = MemoryAppliedSet::new();
        let editor = LedgerEditor {
            db: db.clone(),
            ledger: ledger.clone(),
        };
        let mut executor = MigrationExecutor::new(editor, applied.clone(), LocalLock::new());

        let result = executor.migrate(&graph, &MigrationTarget::Latest).await.unwrap();
        assert_eq!(result.applied.len(), 2);
        assert_eq!(ledger.ids().len(), 2);
        assert!(applied.ids().is_empty());
        assert!(db.has_table("yoyaku_preschoolclass"));
    }
}
