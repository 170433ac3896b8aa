use serde::{Deserialize, Serialize};

use super::field::{resolve_model_ref, table_name, FieldDef};
use crate::error::{Result, StrataError};

/// State of one model after replaying migration operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Namespace (application label) the model belongs to.
    pub app: String,

    /// Model name as declared (e.g. `PreschoolClass`).
    pub name: String,

    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl ModelState {
    /// Create a new model state without fields.
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field (builder style).
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Lookup key: `(app, lowercase name)`.
    pub fn key(&self) -> (String, String) {
        (self.app.clone(), self.name_lower())
    }

    pub fn name_lower(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn table_name(&self) -> String {
        table_name(&self.app, &self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with the model named in the error.
    pub fn get_field(&self, name: &str) -> Result<&FieldDef> {
        self.field(name).ok_or_else(|| {
            StrataError::InvalidState(format!("model {}.{} has no field '{}'", self.app, self.name, name))
        })
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Insert the implicit `id` primary key when none is declared.
    pub fn ensure_primary_key(&mut self) {
        if self.primary_key().is_none() {
            self.fields.insert(0, FieldDef::auto_id());
        }
    }

    /// Fields stored as columns of this model's table.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_many_to_many())
    }

    /// Many-to-many fields (each backed by a join table).
    pub fn many_to_many_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_many_to_many())
    }

    /// Table a relation field points at.
    pub fn related_table(&self, field: &FieldDef) -> Option<String> {
        field.relation_target().map(|target| {
            let (app, model) = resolve_model_ref(target, &self.app);
            table_name(&app, &model)
        })
    }

    /// Join table backing a many-to-many field.
    pub fn join_table_name(&self, field: &FieldDef) -> String {
        format!("{}_{}", self.table_name(), field.name.to_lowercase())
    }

    /// Join table columns `(source, target)` for a many-to-many field.
    pub fn join_columns(&self, field: &FieldDef) -> (String, String) {
        let source = self.name_lower();
        let target = field
            .relation_target()
            .map(|t| resolve_model_ref(t, &self.app).1)
            .unwrap_or_default();
        if source == target {
            (format!("from_{}_id", source), format!("to_{}_id", target))
        } else {
            (format!("{}_id", source), format!("{}_id", target))
        }
    }

    /// Check field names and definitions.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(StrataError::Validation(format!(
                    "model {}.{} declares field '{}' more than once",
                    self.app, self.name, field.name
                )));
            }
            field.validate()?;
        }
        if self.fields.iter().filter(|f| f.primary_key).count() > 1 {
            return Err(StrataError::Validation(format!(
                "model {}.{} declares more than one primary key",
                self.app, self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, OnDelete};

    #[test]
    fn test_table_and_join_names() {
        let event = ModelState::new("yoyaku", "Event")
            .with_field(FieldDef::auto_id())
            .with_field(FieldDef::new(
                "student_user",
                FieldKind::many_to_many("yoyaku.StudentProfile"),
            ));
        let m2m = event.field("student_user").unwrap();
        assert_eq!(event.table_name(), "yoyaku_event");
        assert_eq!(event.join_table_name(m2m), "yoyaku_event_student_user");
        assert_eq!(
            event.join_columns(m2m),
            ("event_id".to_string(), "studentprofile_id".to_string())
        );
        assert_eq!(event.related_table(m2m).as_deref(), Some("yoyaku_studentprofile"));
    }

    #[test]
    fn test_self_referencing_join_columns() {
        let user = ModelState::new("yoyaku", "MyUser")
            .with_field(FieldDef::new("friends", FieldKind::many_to_many("yoyaku.MyUser")));
        let field = user.field("friends").unwrap();
        assert_eq!(
            user.join_columns(field),
            ("from_myuser_id".to_string(), "to_myuser_id".to_string())
        );
    }

    #[test]
    fn test_ensure_primary_key() {
        let mut model = ModelState::new("yoyaku", "PreschoolClass")
            .with_field(FieldDef::new("name", FieldKind::Char { max_length: 300 }));
        model.ensure_primary_key();
        assert_eq!(model.fields[0].name, "id");
        model.ensure_primary_key();
        assert_eq!(model.fields.len(), 2);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let model = ModelState::new("yoyaku", "Event")
            .with_field(FieldDef::new("teacher_user", FieldKind::foreign_key("yoyaku.TeacherProfile", OnDelete::Cascade)))
            .with_field(FieldDef::new("teacher_user", FieldKind::Integer));
        assert!(model.validate().is_err());
    }
}
