//! In-memory schema store.
//!
//! Mirrors the parts of PostgreSQL behaviour a ledger run can observe:
//! tables and columns, NOT NULL / length / choice checks, foreign keys with
//! their delete policies, unique constraints and transactional DDL. Used by
//! tests and by `strata migrate check`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use strata_core::error::{Result, StrataError};
use strata_core::migration::MigrationId;
use strata_core::schema::{FieldDef, FieldKind, ModelState, OnDelete};
use tracing::debug;
use uuid::Uuid;

use super::{AppliedMigration, AppliedSet, BoxFuture, MigrationLock, SchemaEditor};

/// A stored row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

/// Foreign key constraint on a column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    pub on_delete: OnDelete,
}

/// Column definition as the store enforces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    /// Field the column was created from, stripped of purely descriptive attributes.
    pub definition: FieldDef,
    pub references: Option<ForeignKeyRef>,
}

impl Column {
    fn new(field: &FieldDef, references: Option<ForeignKeyRef>) -> Self {
        let mut definition = field.clone();
        definition.verbose_name = None;
        if let FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) = &mut definition.kind {
            rel.to.clear();
            rel.related_name = None;
            rel.related_query_name = None;
        }
        Self {
            definition,
            references,
        }
    }

    fn join_key(name: &str, references: ForeignKeyRef) -> Self {
        Self {
            definition: FieldDef::new(name, FieldKind::Integer),
            references: Some(references),
        }
    }

    pub fn nullable(&self) -> bool {
        self.definition.null
    }

    pub fn is_unique(&self) -> bool {
        self.definition.unique
            || self.definition.primary_key
            || matches!(self.definition.kind, FieldKind::OneToOne(_))
    }

    /// Check a value against NOT NULL, type, length and choice constraints.
    pub fn check(&self, value: &Value) -> Result<()> {
        self.definition.validate_value(value)
    }
}

/// Comparable view of every table's columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, BTreeMap<String, Column>>,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&BTreeMap<String, Column>> {
        self.tables.get(name)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&Column> {
        self.tables.get(table).and_then(|t| t.get(column))
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: BTreeMap<String, Column>,
    rows: BTreeMap<i64, Row>,
    unique_together: Vec<Vec<String>>,
    next_id: i64,
}

impl Table {
    fn pk_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, c)| c.definition.primary_key)
            .map(|(name, _)| name.as_str())
    }

    fn rename_column(&mut self, old: &str, new: &str) {
        if let Some(column) = self.columns.remove(old) {
            self.columns.insert(new.to_string(), column);
        }
        for row in self.rows.values_mut() {
            if let Some(value) = row.remove(old) {
                row.insert(new.to_string(), value);
            }
        }
        for set in &mut self.unique_together {
            for col in set.iter_mut() {
                if col == old {
                    *col = new.to_string();
                }
            }
        }
    }
}

#[derive(Debug)]
struct Savepoint {
    tables: BTreeMap<String, Table>,
    executed: usize,
}

#[derive(Debug, Default)]
struct Store {
    tables: BTreeMap<String, Table>,
    executed_sql: Vec<String>,
    savepoint: Option<Savepoint>,
}

/// Shared handle to an in-memory schema store.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current column layout of every table.
    pub fn schema(&self) -> SchemaSnapshot {
        let store = self.lock();
        SchemaSnapshot {
            tables: store
                .tables
                .iter()
                .map(|(name, t)| (name.clone(), t.columns.clone()))
                .collect(),
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<Column> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.columns.get(column).cloned())
    }

    /// Raw SQL statements executed through `RunSql` operations.
    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().executed_sql.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().savepoint.is_some()
    }

    /// Insert a row given as a JSON object; returns its primary key.
    ///
    /// Missing columns take their default, or the next sequence value for a
    /// serial primary key.
    pub fn insert(&self, table: &str, values: Value) -> Result<i64> {
        let Value::Object(values) = values else {
            return Err(StrataError::Validation(
                "row must be a JSON object".to_string(),
            ));
        };

        let mut store = self.lock();
        let t = store.table(table)?;
        if let Some(unknown) = values.keys().find(|k| !t.columns.contains_key(*k)) {
            return Err(StrataError::Database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                unknown, table
            )));
        }
        let pk = t
            .pk_column()
            .ok_or_else(|| StrataError::InvalidState(format!("table \"{}\" has no primary key", table)))?
            .to_string();

        let mut row = Row::new();
        for (name, column) in &t.columns {
            let value = match values.get(name) {
                Some(v) => v.clone(),
                None if *name == pk && column.definition.kind.is_serial() => Value::from(t.next_id + 1),
                None => column.definition.default.clone().unwrap_or(Value::Null),
            };
            column.check(&value)?;
            store.check_reference(table, name, column, &value)?;
            row.insert(name.clone(), value);
        }

        let id = row.get(&pk).and_then(Value::as_i64).ok_or_else(|| {
            StrataError::Integrity(format!("primary key of \"{}\" must be an integer", table))
        })?;
        if t.rows.contains_key(&id) {
            return Err(StrataError::Integrity(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                table
            )));
        }
        check_unique(table, t, &row, None)?;

        let t = store.table_mut(table)?;
        t.next_id = t.next_id.max(id);
        t.rows.insert(id, row);
        Ok(id)
    }

    /// Update one column of a row.
    pub fn update(&self, table: &str, id: i64, column: &str, value: Value) -> Result<()> {
        let mut store = self.lock();
        let t = store.table(table)?;
        let col = t.columns.get(column).ok_or_else(|| {
            StrataError::Database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                column, table
            ))
        })?;
        let mut row = t
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("row {} in \"{}\"", id, table)))?;
        col.check(&value)?;
        store.check_reference(table, column, col, &value)?;
        row.insert(column.to_string(), value);
        check_unique(table, t, &row, Some(id))?;

        store.table_mut(table)?.rows.insert(id, row);
        Ok(())
    }

    pub fn get(&self, table: &str, id: i64) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Delete a row, applying the delete policy of every foreign key that
    /// points at it. Returns the number of rows removed, cascades included.
    ///
    /// A protected reference aborts the delete before anything changes.
    pub fn delete(&self, table: &str, id: i64) -> Result<usize> {
        let mut store = self.lock();
        store.table(table)?;
        let plan = store.plan_deletion(table, id)?;

        for (t, row_id, column, value) in plan.updates {
            if plan.deleted.contains(&(t.clone(), row_id)) {
                continue;
            }
            if let Some(row) = store.tables.get_mut(&t).and_then(|t| t.rows.get_mut(&row_id)) {
                row.insert(column, value);
            }
        }
        for (t, row_id) in &plan.deleted {
            if let Some(table) = store.tables.get_mut(t) {
                table.rows.remove(row_id);
            }
        }
        Ok(plan.deleted.len())
    }
}

#[derive(Default)]
struct DeletionPlan {
    deleted: BTreeSet<(String, i64)>,
    updates: Vec<(String, i64, String, Value)>,
}

fn column_of(field: &FieldDef) -> Result<String> {
    field.column_name().ok_or_else(|| {
        StrataError::Validation(format!("field '{}' is not stored as a column", field.name))
    })
}

fn check_unique(name: &str, table: &Table, row: &Row, skip: Option<i64>) -> Result<()> {
    let others = || {
        table
            .rows
            .iter()
            .filter(move |(id, _)| Some(**id) != skip)
            .map(|(_, r)| r)
    };

    for (col, column) in &table.columns {
        if !column.is_unique() || column.definition.primary_key {
            continue;
        }
        let value = row.get(col).unwrap_or(&NULL);
        if !value.is_null() && others().any(|r| r.get(col) == Some(value)) {
            return Err(StrataError::Integrity(format!(
                "duplicate key value violates unique constraint \"{}_{}_key\"",
                name, col
            )));
        }
    }

    for set in &table.unique_together {
        let key: Vec<&Value> = set.iter().map(|c| row.get(c).unwrap_or(&NULL)).collect();
        if others().any(|r| set.iter().map(|c| r.get(c).unwrap_or(&NULL)).eq(key.iter().copied())) {
            return Err(StrataError::Integrity(format!(
                "duplicate key value violates unique constraint \"{}_{}_uniq\"",
                name,
                set.join("_")
            )));
        }
    }
    Ok(())
}

impl Store {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| {
            StrataError::Database(format!("relation \"{}\" does not exist", name))
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| {
            StrataError::Database(format!("relation \"{}\" does not exist", name))
        })
    }

    fn pk_of(&self, table: &str) -> Result<String> {
        self.table(table)?
            .pk_column()
            .map(str::to_string)
            .ok_or_else(|| StrataError::InvalidState(format!("table \"{}\" has no primary key", table)))
    }

    /// Column for `field`, resolving the referenced table of a foreign key.
    fn column_for(&self, model: &ModelState, field: &FieldDef) -> Result<Column> {
        let references = match field.on_delete() {
            Some(on_delete) => {
                let table = model.related_table(field).unwrap_or_default();
                let column = if table == model.table_name() && !self.tables.contains_key(&table) {
                    model
                        .primary_key()
                        .and_then(FieldDef::column_name)
                        .unwrap_or_else(|| "id".to_string())
                } else {
                    self.pk_of(&table)?
                };
                Some(ForeignKeyRef {
                    table,
                    column,
                    on_delete,
                })
            }
            None => None,
        };
        Ok(Column::new(field, references))
    }

    fn check_reference(&self, table: &str, name: &str, column: &Column, value: &Value) -> Result<()> {
        let Some(ref fk) = column.references else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        let exists = value
            .as_i64()
            .is_some_and(|id| self.tables.get(&fk.table).is_some_and(|t| t.rows.contains_key(&id)));
        if !exists {
            return Err(StrataError::Integrity(format!(
                "insert or update on table \"{}\" violates foreign key constraint \"{}_{}_fk\": key {} is not present in table \"{}\"",
                table, table, name, value, fk.table
            )));
        }
        Ok(())
    }

    /// Columns of any table that reference `table`.
    fn referencing_columns(&self, table: &str) -> Vec<(String, String, ForeignKeyRef)> {
        self.tables
            .iter()
            .flat_map(|(name, t)| {
                t.columns.iter().filter_map(move |(col, c)| {
                    c.references
                        .as_ref()
                        .filter(|r| r.table == table)
                        .map(|r| (name.clone(), col.clone(), r.clone()))
                })
            })
            .collect()
    }

    fn plan_deletion(&self, table: &str, id: i64) -> Result<DeletionPlan> {
        let mut plan = DeletionPlan::default();
        let mut queue = vec![(table.to_string(), id)];

        while let Some((current, row_id)) = queue.pop() {
            let exists = self
                .tables
                .get(&current)
                .is_some_and(|t| t.rows.contains_key(&row_id));
            if !exists || !plan.deleted.insert((current.clone(), row_id)) {
                continue;
            }

            for (other, col, fk) in self.referencing_columns(&current) {
                let Some(other_table) = self.tables.get(&other) else {
                    continue;
                };
                let column = &other_table.columns[&col];
                for (other_id, row) in &other_table.rows {
                    if row.get(&col).and_then(Value::as_i64) != Some(row_id) {
                        continue;
                    }
                    match fk.on_delete {
                        OnDelete::Cascade => queue.push((other.clone(), *other_id)),
                        OnDelete::SetNull => {
                            plan.updates.push((other.clone(), *other_id, col.clone(), Value::Null))
                        }
                        OnDelete::SetDefault => plan.updates.push((
                            other.clone(),
                            *other_id,
                            col.clone(),
                            column.definition.default.clone().unwrap_or(Value::Null),
                        )),
                        OnDelete::Protect | OnDelete::Restrict => {
                            return Err(StrataError::Integrity(format!(
                                "cannot delete row {} of \"{}\": referenced through protected foreign key \"{}\".\"{}\"",
                                row_id, current, other, col
                            )));
                        }
                        OnDelete::DoNothing => {}
                    }
                }
            }
        }
        Ok(plan)
    }

    fn create_model(&mut self, model: &ModelState) -> Result<()> {
        let name = model.table_name();
        if self.tables.contains_key(&name) {
            return Err(StrataError::Database(format!(
                "relation \"{}\" already exists",
                name
            )));
        }

        let mut table = Table::default();
        for field in model.column_fields() {
            table.columns.insert(column_of(field)?, self.column_for(model, field)?);
        }
        self.tables.insert(name.clone(), table);
        debug!(table = %name, "Created table");

        for field in model.many_to_many_fields() {
            self.create_join_table(model, field)?;
        }
        Ok(())
    }

    fn create_join_table(&mut self, model: &ModelState, field: &FieldDef) -> Result<()> {
        let name = model.join_table_name(field);
        if self.tables.contains_key(&name) {
            return Err(StrataError::Database(format!(
                "relation \"{}\" already exists",
                name
            )));
        }
        let source = model.table_name();
        let target = model.related_table(field).unwrap_or_default();
        let (source_col, target_col) = model.join_columns(field);

        let mut table = Table::default();
        table
            .columns
            .insert("id".to_string(), Column::new(&FieldDef::auto_id(), None));
        table.columns.insert(
            source_col.clone(),
            Column::join_key(
                &source_col,
                ForeignKeyRef {
                    column: self.pk_of(&source)?,
                    table: source,
                    on_delete: OnDelete::Cascade,
                },
            ),
        );
        table.columns.insert(
            target_col.clone(),
            Column::join_key(
                &target_col,
                ForeignKeyRef {
                    column: self.pk_of(&target)?,
                    table: target,
                    on_delete: OnDelete::Cascade,
                },
            ),
        );
        table.unique_together.push(vec![source_col, target_col]);
        self.tables.insert(name.clone(), table);
        debug!(table = %name, "Created join table");
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> Result<()> {
        self.tables.remove(name).map(|_| ()).ok_or_else(|| {
            StrataError::Database(format!("table \"{}\" does not exist", name))
        })
    }

    fn move_table(&mut self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.tables.contains_key(new) {
            return Err(StrataError::Database(format!(
                "relation \"{}\" already exists",
                new
            )));
        }
        let table = self.tables.remove(old).ok_or_else(|| {
            StrataError::Database(format!("relation \"{}\" does not exist", old))
        })?;
        self.tables.insert(new.to_string(), table);
        for t in self.tables.values_mut() {
            for c in t.columns.values_mut() {
                if let Some(ref mut fk) = c.references {
                    if fk.table == old {
                        fk.table = new.to_string();
                    }
                }
            }
        }
        Ok(())
    }

    fn delete_model(&mut self, model: &ModelState) -> Result<()> {
        let name = model.table_name();
        let joins: BTreeSet<String> = model
            .many_to_many_fields()
            .map(|f| model.join_table_name(f))
            .collect();

        let dependents: Vec<String> = self
            .referencing_columns(&name)
            .into_iter()
            .filter(|(t, _, _)| *t != name && !joins.contains(t))
            .map(|(t, c, _)| format!("{}.{}", t, c))
            .collect();
        if !dependents.is_empty() {
            return Err(StrataError::Database(format!(
                "cannot drop table \"{}\" because other objects depend on it: {}",
                name,
                dependents.join(", ")
            )));
        }

        for join in &joins {
            self.drop_table(join)?;
        }
        self.drop_table(&name)?;
        debug!(table = %name, "Dropped table");
        Ok(())
    }

    fn rename_model(&mut self, old: &ModelState, new: &ModelState) -> Result<()> {
        self.move_table(&old.table_name(), &new.table_name())?;

        for (old_field, new_field) in old.many_to_many_fields().zip(new.many_to_many_fields()) {
            let new_join = new.join_table_name(new_field);
            self.move_table(&old.join_table_name(old_field), &new_join)?;

            let (old_source, _) = old.join_columns(old_field);
            let (new_source, _) = new.join_columns(new_field);
            if old_source != new_source {
                self.table_mut(&new_join)?.rename_column(&old_source, &new_source);
            }
        }
        debug!(from = %old.table_name(), to = %new.table_name(), "Renamed table");
        Ok(())
    }

    fn add_field(&mut self, model: &ModelState, field: &FieldDef) -> Result<()> {
        if field.is_many_to_many() {
            return self.create_join_table(model, field);
        }

        let name = model.table_name();
        let col = column_of(field)?;
        let column = self.column_for(model, field)?;
        let table = self.table(&name)?;
        if table.columns.contains_key(&col) {
            return Err(StrataError::Database(format!(
                "column \"{}\" of relation \"{}\" already exists",
                col, name
            )));
        }

        let fill = if table.rows.is_empty() {
            Value::Null
        } else {
            let fill = field.effective_default().ok_or_else(|| {
                StrataError::Integrity(format!(
                    "column \"{}\" of relation \"{}\" contains null values",
                    col, name
                ))
            })?;
            column.check(&fill)?;
            self.check_reference(&name, &col, &column, &fill)?;
            fill
        };

        let table = self.table_mut(&name)?;
        for row in table.rows.values_mut() {
            row.insert(col.clone(), fill.clone());
        }
        table.columns.insert(col, column);
        Ok(())
    }

    fn remove_field(&mut self, model: &ModelState, field: &FieldDef) -> Result<()> {
        if field.is_many_to_many() {
            return self.drop_table(&model.join_table_name(field));
        }

        let name = model.table_name();
        let col = column_of(field)?;
        let table = self.table_mut(&name)?;
        if table.columns.remove(&col).is_none() {
            return Err(StrataError::Database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                col, name
            )));
        }
        for row in table.rows.values_mut() {
            row.remove(&col);
        }
        table.unique_together.retain(|set| !set.contains(&col));
        Ok(())
    }

    fn alter_field(&mut self, model: &ModelState, old: &FieldDef, new: &FieldDef) -> Result<()> {
        match (old.is_many_to_many(), new.is_many_to_many()) {
            (true, true) => {
                let old_join = model.join_table_name(old);
                if model.related_table(old) != model.related_table(new) {
                    self.drop_table(&old_join)?;
                    self.create_join_table(model, new)
                } else {
                    self.move_table(&old_join, &model.join_table_name(new))
                }
            }
            (false, false) => self.alter_column(model, old, new),
            _ => Err(StrataError::Validation(format!(
                "cannot alter field '{}' to or from a many-to-many relation",
                new.name
            ))),
        }
    }

    fn alter_column(&mut self, model: &ModelState, old: &FieldDef, new: &FieldDef) -> Result<()> {
        let name = model.table_name();
        let old_col = column_of(old)?;
        let new_col = column_of(new)?;
        let column = self.column_for(model, new)?;

        let mut table = self.table(&name)?.clone();
        if !table.columns.contains_key(&old_col) {
            return Err(StrataError::Database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                old_col, name
            )));
        }
        if old_col != new_col {
            if table.columns.contains_key(&new_col) {
                return Err(StrataError::Database(format!(
                    "column \"{}\" of relation \"{}\" already exists",
                    new_col, name
                )));
            }
            table.rename_column(&old_col, &new_col);
        }

        let fill = new.effective_default().filter(|v| !v.is_null());
        for row in table.rows.values_mut() {
            let current = row.get(&new_col).cloned().unwrap_or(Value::Null);
            let value = match (&current, &fill) {
                (Value::Null, Some(fill)) if !new.null => fill.clone(),
                _ => current,
            };
            if value.is_null() && !new.null && !new.kind.is_serial() {
                return Err(StrataError::Integrity(format!(
                    "column \"{}\" of relation \"{}\" contains null values",
                    new_col, name
                )));
            }
            column.check(&value)?;
            self.check_reference(&name, &new_col, &column, &value)?;
            row.insert(new_col.clone(), value);
        }
        table.columns.insert(new_col.clone(), column);
        check_all_unique(&name, &table)?;

        self.tables.insert(name.clone(), table);
        if old_col != new_col {
            for t in self.tables.values_mut() {
                for c in t.columns.values_mut() {
                    if let Some(ref mut fk) = c.references {
                        if fk.table == name && fk.column == old_col {
                            fk.column = new_col.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.savepoint.is_some() {
            return Err(StrataError::InvalidState(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.savepoint = Some(Savepoint {
            tables: self.tables.clone(),
            executed: self.executed_sql.len(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.savepoint.take().map(|_| ()).ok_or_else(|| {
            StrataError::InvalidState("no transaction in progress".to_string())
        })
    }

    fn rollback(&mut self) {
        if let Some(savepoint) = self.savepoint.take() {
            self.tables = savepoint.tables;
            self.executed_sql.truncate(savepoint.executed);
        }
    }
}

fn check_all_unique(name: &str, table: &Table) -> Result<()> {
    for (id, row) in &table.rows {
        check_unique(name, table, row, Some(*id))?;
    }
    Ok(())
}

impl SchemaEditor for MemoryDatabase {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.lock().begin() })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.lock().commit() })
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.lock().rollback();
            Ok(())
        })
    }

    fn create_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().create_model(model) })
    }

    fn delete_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().delete_model(model) })
    }

    fn rename_model<'a>(&'a mut self, old: &'a ModelState, new: &'a ModelState) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().rename_model(old, new) })
    }

    fn add_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().add_field(model, field) })
    }

    fn remove_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().remove_field(model, field) })
    }

    fn alter_field<'a>(
        &'a mut self,
        model: &'a ModelState,
        old: &'a FieldDef,
        new: &'a FieldDef,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.lock().alter_field(model, old, new) })
    }

    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(sql = %sql, "Recording raw SQL");
            self.lock().executed_sql.push(sql.to_string());
            Ok(())
        })
    }
}

/// Applied set held in memory, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryAppliedSet {
    entries: Arc<Mutex<Vec<AppliedMigration>>>,
}

impl MemoryAppliedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<MigrationId> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &MigrationId) -> bool {
        self.ids().contains(id)
    }
}

impl AppliedSet for MemoryAppliedSet {
    fn load(&mut self) -> BoxFuture<'_, Vec<AppliedMigration>> {
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        })
    }

    fn mark_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.iter().any(|a| &a.id == id) {
                return Err(StrataError::Integrity(format!(
                    "migration {} is already recorded as applied",
                    id
                )));
            }
            entries.push(AppliedMigration::new(id.clone(), run_id));
            Ok(())
        })
    }

    fn mark_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|a| &a.id != id);
            Ok(())
        })
    }
}

/// Process-local lock. Handles created with [`LocalLock::handle`] contend
/// for the same flag.
#[derive(Debug, Default)]
pub struct LocalLock {
    flag: Arc<AtomicBool>,
    held: bool,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle on the same lock.
    pub fn handle(&self) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            held: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl MigrationLock for LocalLock {
    fn try_acquire(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if self.held {
                return Ok(true);
            }
            self.held = self
                .flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            Ok(self.held)
        })
    }

    fn release(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.held {
                self.flag.store(false, Ordering::SeqCst);
                self.held = false;
            }
            Ok(())
        })
    }

    fn describe(&self) -> String {
        "in-process lock".to_string()
    }
}
