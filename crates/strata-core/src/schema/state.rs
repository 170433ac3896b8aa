use std::collections::BTreeMap;

use super::field::{resolve_model_ref, FieldDef};
use super::model::ModelState;
use crate::error::{Result, StrataError};

/// The schema produced by replaying migration operations.
///
/// Models are keyed by `(app, lowercase model name)` so lookups are
/// case-insensitive the same way relation targets are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
    models: BTreeMap<(String, String), ModelState>,
}

impl ProjectState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a set of model definitions.
    pub fn from_models(models: impl IntoIterator<Item = ModelState>) -> Result<Self> {
        let mut state = Self::new();
        for model in models {
            state.add_model(model)?;
        }
        Ok(state)
    }

    fn key(app: &str, name: &str) -> (String, String) {
        (app.to_string(), name.to_lowercase())
    }

    pub fn get_model(&self, app: &str, name: &str) -> Option<&ModelState> {
        self.models.get(&Self::key(app, name))
    }

    /// Look up a model, failing when it does not exist.
    pub fn model(&self, app: &str, name: &str) -> Result<&ModelState> {
        self.get_model(app, name)
            .ok_or_else(|| StrataError::InvalidState(format!("no model {}.{} in state", app, name)))
    }

    pub fn model_mut(&mut self, app: &str, name: &str) -> Result<&mut ModelState> {
        self.models
            .get_mut(&Self::key(app, name))
            .ok_or_else(|| StrataError::InvalidState(format!("no model {}.{} in state", app, name)))
    }

    pub fn contains(&self, app: &str, name: &str) -> bool {
        self.models.contains_key(&Self::key(app, name))
    }

    /// Add a model; fails if a model with the same key exists.
    pub fn add_model(&mut self, model: ModelState) -> Result<()> {
        let key = model.key();
        if self.models.contains_key(&key) {
            return Err(StrataError::InvalidState(format!(
                "model {}.{} already exists",
                model.app, model.name
            )));
        }
        self.models.insert(key, model);
        Ok(())
    }

    pub fn remove_model(&mut self, app: &str, name: &str) -> Result<ModelState> {
        self.models
            .remove(&Self::key(app, name))
            .ok_or_else(|| StrataError::InvalidState(format!("no model {}.{} in state", app, name)))
    }

    /// All models in key order.
    pub fn models(&self) -> impl Iterator<Item = &ModelState> {
        self.models.values()
    }

    pub fn models_in<'a>(&'a self, app: &'a str) -> impl Iterator<Item = &'a ModelState> + 'a {
        self.models.values().filter(move |m| m.app == app)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Fields of other models (or this one) that point at `app.name`.
    pub fn referencing_fields(&self, app: &str, name: &str) -> Vec<(&ModelState, &FieldDef)> {
        let target = Self::key(app, name);
        self.models
            .values()
            .flat_map(|m| m.fields.iter().map(move |f| (m, f)))
            .filter(|(m, f)| {
                f.relation_target()
                    .map(|t| resolve_model_ref(t, &m.app) == target)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Check that a relation field points at a model present in the state.
    pub fn check_relation_target(&self, owner: &ModelState, field: &FieldDef) -> Result<()> {
        if let Some(target) = field.relation_target() {
            let (app, model) = resolve_model_ref(target, &owner.app);
            let is_self = app == owner.app && model == owner.name_lower();
            if !is_self && !self.contains(&app, &model) {
                return Err(StrataError::InvalidState(format!(
                    "field {}.{}.{} references unknown model {}",
                    owner.app, owner.name, field.name, target
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, OnDelete};

    fn state() -> ProjectState {
        ProjectState::from_models([
            ModelState::new("yoyaku", "PreschoolClass").with_field(FieldDef::auto_id()),
            ModelState::new("yoyaku", "StudentProfile")
                .with_field(FieldDef::auto_id())
                .with_field(
                    FieldDef::new(
                        "preschool",
                        FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
                    )
                    .nullable(),
                ),
        ])
        .unwrap()
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let state = state();
        assert!(state.get_model("yoyaku", "preschoolclass").is_some());
        assert!(state.get_model("yoyaku", "PRESCHOOLCLASS").is_some());
        assert!(state.model("yoyaku", "Missing").is_err());
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let mut state = state();
        let err = state
            .add_model(ModelState::new("yoyaku", "preschoolClass"))
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidState(_)));
    }

    #[test]
    fn test_referencing_fields() {
        let state = state();
        let refs = state.referencing_fields("yoyaku", "PreschoolClass");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.name, "StudentProfile");
        assert_eq!(refs[0].1.name, "preschool");
    }

    #[test]
    fn test_unknown_relation_target() {
        let state = state();
        let owner = state.model("yoyaku", "StudentProfile").unwrap().clone();
        let field = FieldDef::new("teacher", FieldKind::foreign_key("yoyaku.TeacherProfile", OnDelete::Cascade));
        assert!(state.check_relation_target(&owner, &field).is_err());
    }
}
