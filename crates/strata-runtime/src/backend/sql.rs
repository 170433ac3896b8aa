use strata_core::schema::{FieldDef, ModelState};

use super::{BoxFuture, SchemaEditor};
use crate::ddl;

/// Schema editor that renders DDL without executing it.
#[derive(Debug, Default)]
pub struct SqlCollector {
    statements: Vec<String>,
}

impl SqlCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<String> {
        self.statements
    }

    fn push(&mut self, statements: Vec<String>) -> BoxFuture<'_, ()> {
        self.statements.extend(statements);
        Box::pin(async { Ok(()) })
    }

    fn push_one(&mut self, statement: &str) -> BoxFuture<'_, ()> {
        self.push(vec![statement.to_string()])
    }
}

/// Render statements as a script, one per line, each terminated with `;`.
pub fn render_script(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n")
}

impl SchemaEditor for SqlCollector {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        self.push_one("BEGIN")
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        self.push_one("COMMIT")
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        self.push_one("ROLLBACK")
    }

    fn create_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        self.push(ddl::create_model(model))
    }

    fn delete_model<'a>(&'a mut self, model: &'a ModelState) -> BoxFuture<'a, ()> {
        self.push(ddl::delete_model(model))
    }

    fn rename_model<'a>(&'a mut self, old: &'a ModelState, new: &'a ModelState) -> BoxFuture<'a, ()> {
        self.push(ddl::rename_model(old, new))
    }

    fn add_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        self.push(ddl::add_field(model, field))
    }

    fn remove_field<'a>(&'a mut self, model: &'a ModelState, field: &'a FieldDef) -> BoxFuture<'a, ()> {
        self.push(ddl::remove_field(model, field))
    }

    fn alter_field<'a>(
        &'a mut self,
        model: &'a ModelState,
        old: &'a FieldDef,
        new: &'a FieldDef,
    ) -> BoxFuture<'a, ()> {
        self.push(ddl::alter_field(model, old, new))
    }

    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()> {
        self.push(ddl::split_sql_statements(sql))
    }
}
