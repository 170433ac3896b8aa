//! PostgreSQL DDL rendering.
//!
//! Pure functions from model/field definitions to statements. Constraint
//! names are derived from table and column so later alterations can find
//! them again.

use serde_json::Value;
use strata_core::schema::{FieldDef, FieldKind, ModelState};

/// PostgreSQL's identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 63;

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        other => quote_str(&other.to_string()),
    }
}

fn constraint_name(table: &str, column: &str, suffix: &str) -> String {
    format!("{}_{}_{}", table, column, suffix)
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .collect()
}

pub fn check_constraint_name(table: &str, column: &str) -> String {
    constraint_name(table, column, "check")
}

pub fn fk_constraint_name(table: &str, column: &str) -> String {
    constraint_name(table, column, "fk")
}

pub fn unique_constraint_name(table: &str, column: &str) -> String {
    constraint_name(table, column, "key")
}

fn is_unique(field: &FieldDef) -> bool {
    !field.primary_key && (field.unique || matches!(field.kind, FieldKind::OneToOne(_)))
}

fn column_of(field: &FieldDef) -> String {
    field.column_name().unwrap_or_else(|| field.name.clone())
}

fn stored_default(field: &FieldDef) -> Option<&Value> {
    field.default.as_ref().filter(|v| !v.is_null())
}

/// `col IN (...)` expression for a field with choices.
pub fn check_expression(column: &str, field: &FieldDef) -> Option<String> {
    if field.choices.is_empty() {
        return None;
    }
    let mut values: Vec<String> = field.choices.iter().map(|c| quote_str(c.value())).collect();
    let textual = matches!(field.kind, FieldKind::Char { .. } | FieldKind::Text);
    if textual && field.blank && !field.choices.iter().any(|c| c.value().is_empty()) {
        values.push("''".to_string());
    }
    Some(format!("{} IN ({})", quote(column), values.join(", ")))
}

fn references_clause(model: &ModelState, field: &FieldDef) -> Option<String> {
    let on_delete = field.on_delete()?;
    let target = model.related_table(field)?;
    Some(format!(
        "REFERENCES {} ON DELETE {} DEFERRABLE INITIALLY DEFERRED",
        quote(&target),
        on_delete.to_sql()
    ))
}

/// Column definition as it appears in `CREATE TABLE` / `ADD COLUMN`.
pub fn column_definition(model: &ModelState, field: &FieldDef) -> String {
    let table = model.table_name();
    let column = column_of(field);
    let ty = field.sql_type().map(|t| t.to_sql()).unwrap_or_default();

    let mut sql = format!("{} {}", quote(&column), ty);
    if field.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !field.null {
        sql.push_str(" NOT NULL");
    }
    if is_unique(field) {
        sql.push_str(&format!(
            " CONSTRAINT {} UNIQUE",
            quote(&unique_constraint_name(&table, &column))
        ));
    }
    if let Some(default) = stored_default(field) {
        if !field.kind.is_serial() {
            sql.push_str(&format!(" DEFAULT {}", literal(default)));
        }
    }
    if let Some(check) = check_expression(&column, field) {
        sql.push_str(&format!(
            " CONSTRAINT {} CHECK ({})",
            quote(&check_constraint_name(&table, &column)),
            check
        ));
    }
    if let Some(references) = references_clause(model, field) {
        sql.push_str(&format!(
            " CONSTRAINT {} {}",
            quote(&fk_constraint_name(&table, &column)),
            references
        ));
    }
    sql
}

/// `CREATE TABLE` for a many-to-many join table.
pub fn create_join_table(model: &ModelState, field: &FieldDef) -> String {
    let join = model.join_table_name(field);
    let target = model.related_table(field).unwrap_or_default();
    let (source_col, target_col) = model.join_columns(field);

    let key = |col: &str, table: &str| {
        format!(
            "{} INTEGER NOT NULL CONSTRAINT {} REFERENCES {} ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED",
            quote(col),
            quote(&fk_constraint_name(&join, col)),
            quote(table)
        )
    };

    format!(
        "CREATE TABLE {} (\n    \"id\" SERIAL PRIMARY KEY,\n    {},\n    {},\n    CONSTRAINT {} UNIQUE ({}, {})\n)",
        quote(&join),
        key(&source_col, &model.table_name()),
        key(&target_col, &target),
        quote(&constraint_name(&join, &format!("{}_{}", source_col, target_col), "uniq")),
        quote(&source_col),
        quote(&target_col)
    )
}

pub fn create_model(model: &ModelState) -> Vec<String> {
    let columns: Vec<String> = model
        .column_fields()
        .map(|f| column_definition(model, f))
        .collect();
    let mut out = vec![format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote(&model.table_name()),
        columns.join(",\n    ")
    )];
    out.extend(model.many_to_many_fields().map(|f| create_join_table(model, f)));
    out
}

pub fn delete_model(model: &ModelState) -> Vec<String> {
    let mut out: Vec<String> = model
        .many_to_many_fields()
        .map(|f| format!("DROP TABLE {}", quote(&model.join_table_name(f))))
        .collect();
    out.push(format!("DROP TABLE {}", quote(&model.table_name())));
    out
}

/// Names of the constraints a column carries.
fn column_constraints(table: &str, field: &FieldDef) -> Vec<String> {
    let column = column_of(field);
    let mut names = Vec::new();
    if is_unique(field) {
        names.push(unique_constraint_name(table, &column));
    }
    if !field.choices.is_empty() {
        names.push(check_constraint_name(table, &column));
    }
    if field.on_delete().is_some() {
        names.push(fk_constraint_name(table, &column));
    }
    names
}

fn rename_constraints(table: &str, old: &[String], new: &[String]) -> Vec<String> {
    old.iter()
        .zip(new)
        .filter(|(o, n)| o != n)
        .map(|(o, n)| {
            format!(
                "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                quote(table),
                quote(o),
                quote(n)
            )
        })
        .collect()
}

pub fn rename_model(old: &ModelState, new: &ModelState) -> Vec<String> {
    let old_table = old.table_name();
    let new_table = new.table_name();
    let mut out = Vec::new();

    if old_table != new_table {
        out.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote(&old_table),
            quote(&new_table)
        ));
        for field in new.column_fields() {
            out.extend(rename_constraints(
                &new_table,
                &column_constraints(&old_table, field),
                &column_constraints(&new_table, field),
            ));
        }
    }

    for (old_field, new_field) in old.many_to_many_fields().zip(new.many_to_many_fields()) {
        let old_join = old.join_table_name(old_field);
        let new_join = new.join_table_name(new_field);
        let (old_source, target) = old.join_columns(old_field);
        let (new_source, _) = new.join_columns(new_field);

        if old_join != new_join {
            out.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                quote(&old_join),
                quote(&new_join)
            ));
        }
        if old_source != new_source {
            out.push(format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote(&new_join),
                quote(&old_source),
                quote(&new_source)
            ));
        }
        out.extend(rename_constraints(
            &new_join,
            &[
                fk_constraint_name(&old_join, &old_source),
                fk_constraint_name(&old_join, &target),
                constraint_name(&old_join, &format!("{}_{}", old_source, target), "uniq"),
            ],
            &[
                fk_constraint_name(&new_join, &new_source),
                fk_constraint_name(&new_join, &target),
                constraint_name(&new_join, &format!("{}_{}", new_source, target), "uniq"),
            ],
        ));
    }
    out
}

pub fn add_field(model: &ModelState, field: &FieldDef) -> Vec<String> {
    if field.is_many_to_many() {
        return vec![create_join_table(model, field)];
    }

    let table = quote(&model.table_name());
    // Existing rows get the effective default, which is then dropped again
    // when the field itself declares none.
    let staged = match field.effective_default() {
        Some(value) if field.default.is_none() && !value.is_null() => {
            let mut staged = field.clone();
            staged.default = Some(value);
            Some(staged)
        }
        _ => None,
    };

    let mut out = vec![format!(
        "ALTER TABLE {} ADD COLUMN {}",
        table,
        column_definition(model, staged.as_ref().unwrap_or(field))
    )];
    if staged.is_some() {
        out.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
            table,
            quote(&column_of(field))
        ));
    }
    out
}

pub fn remove_field(model: &ModelState, field: &FieldDef) -> Vec<String> {
    if field.is_many_to_many() {
        return vec![format!("DROP TABLE {}", quote(&model.join_table_name(field)))];
    }
    vec![format!(
        "ALTER TABLE {} DROP COLUMN {} CASCADE",
        quote(&model.table_name()),
        quote(&column_of(field))
    )]
}

pub fn alter_field(model: &ModelState, old: &FieldDef, new: &FieldDef) -> Vec<String> {
    match (old.is_many_to_many(), new.is_many_to_many()) {
        (true, true) => return alter_many_to_many(model, old, new),
        (false, false) => {}
        _ => return Vec::new(),
    }

    let table = model.table_name();
    let t = quote(&table);
    let old_col = column_of(old);
    let new_col = column_of(new);
    let col = quote(&new_col);
    let mut out = Vec::new();

    if old_col != new_col {
        out.push(format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            t,
            quote(&old_col),
            col
        ));
        let mut renamed = old.clone();
        renamed.name = new.name.clone();
        out.extend(rename_constraints(
            &table,
            &column_constraints(&table, old),
            &column_constraints(&table, &renamed),
        ));
    }

    let fk_changed = old.on_delete() != new.on_delete() || model.related_table(old) != model.related_table(new);
    let old_check = check_expression(&new_col, old);
    let new_check = check_expression(&new_col, new);

    if old.on_delete().is_some() && fk_changed {
        out.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            t,
            quote(&fk_constraint_name(&table, &new_col))
        ));
    }
    if old_check.is_some() && old_check != new_check {
        out.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            t,
            quote(&check_constraint_name(&table, &new_col))
        ));
    }

    if old.sql_type() != new.sql_type() {
        if let Some(ty) = new.sql_type() {
            let ty = ty.to_alter_sql();
            out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                t, col, ty, col, ty
            ));
        }
    }

    if stored_default(old) != stored_default(new) {
        match stored_default(new) {
            Some(value) => out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                t,
                col,
                literal(value)
            )),
            None => out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                t, col
            )),
        }
    }

    if old.null && !new.null {
        if let Some(value) = new.effective_default().filter(|v| !v.is_null()) {
            out.push(format!(
                "UPDATE {} SET {} = {} WHERE {} IS NULL",
                t,
                col,
                literal(&value),
                col
            ));
        }
        out.push(format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", t, col));
    } else if !old.null && new.null {
        out.push(format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", t, col));
    }

    match (is_unique(old), is_unique(new)) {
        (true, false) => out.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            t,
            quote(&unique_constraint_name(&table, &new_col))
        )),
        (false, true) => out.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            t,
            quote(&unique_constraint_name(&table, &new_col)),
            col
        )),
        _ => {}
    }

    if let Some(check) = new_check.as_ref().filter(|_| old_check != new_check) {
        out.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
            t,
            quote(&check_constraint_name(&table, &new_col)),
            check
        ));
    }

    if fk_changed {
        if let Some(references) = references_clause(model, new) {
            out.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) {}",
                t,
                quote(&fk_constraint_name(&table, &new_col)),
                col,
                references
            ));
        }
    }

    out
}

fn alter_many_to_many(model: &ModelState, old: &FieldDef, new: &FieldDef) -> Vec<String> {
    let old_join = model.join_table_name(old);
    let new_join = model.join_table_name(new);

    if model.related_table(old) != model.related_table(new) {
        return vec![
            format!("DROP TABLE {}", quote(&old_join)),
            create_join_table(model, new),
        ];
    }
    if old_join == new_join {
        return Vec::new();
    }

    let (source, target) = model.join_columns(new);
    let mut out = vec![format!(
        "ALTER TABLE {} RENAME TO {}",
        quote(&old_join),
        quote(&new_join)
    )];
    out.extend(rename_constraints(
        &new_join,
        &[
            fk_constraint_name(&old_join, &source),
            fk_constraint_name(&old_join, &target),
            constraint_name(&old_join, &format!("{}_{}", source, target), "uniq"),
        ],
        &[
            fk_constraint_name(&new_join, &source),
            fk_constraint_name(&new_join, &target),
            constraint_name(&new_join, &format!("{}_{}", source, target), "uniq"),
        ],
    ));
    out
}

/// Split SQL into individual statements, respecting dollar-quoted strings.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_dollar_quote = false;
    let mut dollar_tag = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);

        if c == '$' {
            let mut tag = String::from("$");
            while let Some(&next) = chars.peek() {
                if next == '$' || next.is_alphanumeric() || next == '_' {
                    chars.next();
                    tag.push(next);
                    current.push(next);
                    if next == '$' {
                        break;
                    }
                } else {
                    break;
                }
            }

            if tag.len() >= 2 && tag.ends_with('$') {
                if in_dollar_quote && tag == dollar_tag {
                    in_dollar_quote = false;
                    dollar_tag.clear();
                } else if !in_dollar_quote {
                    in_dollar_quote = true;
                    dollar_tag = tag;
                }
            }
        }

        if c == ';' && !in_dollar_quote {
            push_statement(&mut statements, &current);
            current.clear();
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let stmt = raw.trim().trim_end_matches(';').trim();
    let comment_only = stmt.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    });
    if !comment_only {
        statements.push(stmt.to_string());
    }
}
