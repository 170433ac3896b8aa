use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::schema::{resolve_model_ref, FieldDef, ModelState, ProjectState};

/// One atomic schema-change action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Create a model and its table.
    CreateModel { name: String, fields: Vec<FieldDef> },

    /// Drop a model and its table.
    DeleteModel { name: String },

    /// Rename a model (and its table).
    RenameModel { old_name: String, new_name: String },

    /// Add a field to an existing model.
    AddField { model_name: String, field: FieldDef },

    /// Remove a field from a model.
    RemoveField { model_name: String, name: String },

    /// Replace the definition of an existing field (matched by `field.name`).
    AlterField { model_name: String, field: FieldDef },

    /// Rename a field, keeping its definition.
    RenameField {
        model_name: String,
        old_name: String,
        new_name: String,
    },

    /// Raw SQL; reversible only when `reverse_sql` is given.
    RunSql {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse_sql: Option<String>,
    },
}

impl Operation {
    /// Human-readable description, used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateModel { name, .. } => format!("Create model {}", name),
            Operation::DeleteModel { name } => format!("Delete model {}", name),
            Operation::RenameModel { old_name, new_name } => {
                format!("Rename model {} to {}", old_name, new_name)
            }
            Operation::AddField { model_name, field } => {
                format!("Add field {} to {}", field.name, model_name)
            }
            Operation::RemoveField { model_name, name } => {
                format!("Remove field {} from {}", name, model_name)
            }
            Operation::AlterField { model_name, field } => {
                format!("Alter field {} on {}", field.name, model_name)
            }
            Operation::RenameField {
                model_name,
                old_name,
                new_name,
            } => format!("Rename field {} on {} to {}", old_name, model_name, new_name),
            Operation::RunSql { .. } => "Raw SQL operation".to_string(),
        }
    }

    /// Name fragment used when naming a generated record.
    pub fn migration_name_fragment(&self) -> Option<String> {
        match self {
            Operation::CreateModel { name, .. } => Some(name.to_lowercase()),
            Operation::DeleteModel { name } => Some(format!("delete_{}", name.to_lowercase())),
            Operation::RenameModel { old_name, new_name } => Some(format!(
                "rename_{}_{}",
                old_name.to_lowercase(),
                new_name.to_lowercase()
            )),
            Operation::AddField { model_name, field } => Some(format!(
                "{}_{}",
                model_name.to_lowercase(),
                field.name.to_lowercase()
            )),
            Operation::RemoveField { model_name, name } => Some(format!(
                "remove_{}_{}",
                model_name.to_lowercase(),
                name.to_lowercase()
            )),
            Operation::AlterField { model_name, field } => Some(format!(
                "alter_{}_{}",
                model_name.to_lowercase(),
                field.name.to_lowercase()
            )),
            Operation::RenameField {
                model_name,
                old_name,
                new_name,
            } => Some(format!(
                "rename_{}_{}_{}",
                old_name.to_lowercase(),
                model_name.to_lowercase(),
                new_name.to_lowercase()
            )),
            Operation::RunSql { .. } => None,
        }
    }

    /// Whether the operation has an inverse.
    pub fn is_reversible(&self) -> bool {
        match self {
            Operation::RunSql { reverse_sql, .. } => reverse_sql.is_some(),
            _ => true,
        }
    }

    /// Apply this operation to the in-memory project state.
    pub fn state_forwards(&self, app: &str, state: &mut ProjectState) -> Result<()> {
        match self {
            Operation::CreateModel { name, fields } => {
                let mut model = ModelState::new(app, name.clone());
                model.fields = fields.clone();
                model.ensure_primary_key();
                model.validate()?;
                for field in &model.fields {
                    state.check_relation_target(&model, field)?;
                }
                state.add_model(model)
            }

            Operation::DeleteModel { name } => {
                let external: Vec<String> = state
                    .referencing_fields(app, name)
                    .into_iter()
                    .filter(|(m, _)| !(m.app == app && m.name_lower() == name.to_lowercase()))
                    .map(|(m, f)| format!("{}.{}", m.name, f.name))
                    .collect();
                if !external.is_empty() {
                    return Err(StrataError::InvalidState(format!(
                        "cannot delete model {}.{}: still referenced by {}",
                        app,
                        name,
                        external.join(", ")
                    )));
                }
                state.remove_model(app, name).map(|_| ())
            }

            Operation::RenameModel { old_name, new_name } => {
                let many_targets: Vec<String> = state
                    .referencing_fields(app, old_name)
                    .into_iter()
                    .filter(|(_, f)| f.is_many_to_many())
                    .map(|(m, f)| format!("{}.{}", m.name, f.name))
                    .collect();
                if !many_targets.is_empty() {
                    return Err(StrataError::InvalidState(format!(
                        "cannot rename model {}.{} while many-to-many fields point at it: {}",
                        app,
                        old_name,
                        many_targets.join(", ")
                    )));
                }
                if old_name.to_lowercase() != new_name.to_lowercase()
                    && state.contains(app, new_name)
                {
                    return Err(StrataError::InvalidState(format!(
                        "model {}.{} already exists",
                        app, new_name
                    )));
                }

                let old_key = (app.to_string(), old_name.to_lowercase());
                let new_target = format!("{}.{}", app, new_name);
                let referencing: Vec<((String, String), String)> = state
                    .referencing_fields(app, old_name)
                    .into_iter()
                    .map(|(m, f)| (m.key(), f.name.clone()))
                    .collect();

                let mut model = state.remove_model(app, old_name)?;
                model.name = new_name.clone();
                state.add_model(model)?;

                for ((owner_app, owner_name), field_name) in referencing {
                    let owner_name = if (owner_app.clone(), owner_name.clone()) == old_key {
                        new_name.to_lowercase()
                    } else {
                        owner_name
                    };
                    let owner = state.model_mut(&owner_app, &owner_name)?;
                    if let Some(field) = owner.field_mut(&field_name) {
                        retarget(field, &new_target);
                    }
                }
                Ok(())
            }

            Operation::AddField { model_name, field } => {
                field.validate()?;
                let model = state.model(app, model_name)?;
                if model.field(&field.name).is_some() {
                    return Err(StrataError::InvalidState(format!(
                        "model {}.{} already has a field '{}'",
                        app, model_name, field.name
                    )));
                }
                state.check_relation_target(model, field)?;
                state.model_mut(app, model_name)?.fields.push(field.clone());
                Ok(())
            }

            Operation::RemoveField { model_name, name } => {
                let model = state.model_mut(app, model_name)?;
                let before = model.fields.len();
                model.fields.retain(|f| &f.name != name);
                if model.fields.len() == before {
                    return Err(StrataError::InvalidState(format!(
                        "model {}.{} has no field '{}'",
                        app, model_name, name
                    )));
                }
                Ok(())
            }

            Operation::AlterField { model_name, field } => {
                field.validate()?;
                let model = state.model(app, model_name)?;
                let current = model.get_field(&field.name)?;
                if current.is_many_to_many() != field.is_many_to_many() {
                    return Err(StrataError::Validation(format!(
                        "cannot alter field {}.{}.{} into {}: you cannot alter to or from many-to-many fields",
                        app,
                        model_name,
                        field.name,
                        field.kind.label()
                    )));
                }
                state.check_relation_target(model, field)?;
                let slot = state
                    .model_mut(app, model_name)?
                    .field_mut(&field.name)
                    .ok_or_else(|| StrataError::InvalidState(format!("field '{}' vanished", field.name)))?;
                *slot = field.clone();
                Ok(())
            }

            Operation::RenameField {
                model_name,
                old_name,
                new_name,
            } => {
                let model = state.model_mut(app, model_name)?;
                if model.field(new_name).is_some() {
                    return Err(StrataError::InvalidState(format!(
                        "model {}.{} already has a field '{}'",
                        app, model_name, new_name
                    )));
                }
                let field = model.field_mut(old_name).ok_or_else(|| {
                    StrataError::InvalidState(format!(
                        "model {}.{} has no field '{}'",
                        app, model_name, old_name
                    ))
                })?;
                field.name = new_name.clone();
                field.validate()
            }

            Operation::RunSql { .. } => Ok(()),
        }
    }

    /// Models this operation creates, modifies or references, as `(app, model_lower)`.
    pub fn touched_models(&self, app: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        match self {
            Operation::CreateModel { name, fields } => {
                out.push((app.to_string(), name.to_lowercase()));
                for f in fields {
                    if let Some(t) = f.relation_target() {
                        out.push(resolve_model_ref(t, app));
                    }
                }
            }
            Operation::DeleteModel { name } => out.push((app.to_string(), name.to_lowercase())),
            Operation::RenameModel { old_name, new_name } => {
                out.push((app.to_string(), old_name.to_lowercase()));
                out.push((app.to_string(), new_name.to_lowercase()));
            }
            Operation::AddField { model_name, field } | Operation::AlterField { model_name, field } => {
                out.push((app.to_string(), model_name.to_lowercase()));
                if let Some(t) = field.relation_target() {
                    out.push(resolve_model_ref(t, app));
                }
            }
            Operation::RemoveField { model_name, .. } | Operation::RenameField { model_name, .. } => {
                out.push((app.to_string(), model_name.to_lowercase()))
            }
            Operation::RunSql { .. } => {}
        }
        out
    }
}

fn retarget(field: &mut FieldDef, target: &str) {
    use crate::schema::FieldKind;
    match &mut field.kind {
        FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => rel.to = target.to_string(),
        FieldKind::ManyToMany(rel) => rel.to = target.to_string(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, OnDelete};

    fn preschool_state() -> ProjectState {
        let mut state = ProjectState::new();
        Operation::CreateModel {
            name: "StudentProfile".into(),
            fields: vec![FieldDef::auto_id()],
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();
        Operation::CreateModel {
            name: "PreschoolClass".into(),
            fields: vec![
                FieldDef::auto_id(),
                FieldDef::new("name", FieldKind::Char { max_length: 300 }),
                FieldDef::new("limit", FieldKind::Integer),
            ],
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();
        state
    }

    #[test]
    fn test_create_model_adds_implicit_id() {
        let mut state = ProjectState::new();
        Operation::CreateModel {
            name: "Thing".into(),
            fields: vec![FieldDef::new("label", FieldKind::Text)],
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();
        let model = state.model("yoyaku", "thing").unwrap();
        assert!(model.primary_key().is_some());
    }

    #[test]
    fn test_add_field_requires_existing_target() {
        let mut state = preschool_state();
        let op = Operation::AddField {
            model_name: "studentprofile".into(),
            field: FieldDef::new("teacher", FieldKind::foreign_key("yoyaku.TeacherProfile", OnDelete::Cascade)),
        };
        assert!(op.state_forwards("yoyaku", &mut state).is_err());
    }

    #[test]
    fn test_add_field_twice_rejected() {
        let mut state = preschool_state();
        let op = Operation::AddField {
            model_name: "studentprofile".into(),
            field: FieldDef::new(
                "preschool",
                FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
            )
            .nullable(),
        };
        op.state_forwards("yoyaku", &mut state).unwrap();
        assert!(op.state_forwards("yoyaku", &mut state).is_err());
    }

    #[test]
    fn test_delete_referenced_model_rejected() {
        let mut state = preschool_state();
        Operation::AddField {
            model_name: "studentprofile".into(),
            field: FieldDef::new(
                "preschool",
                FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
            )
            .nullable(),
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();

        let err = Operation::DeleteModel {
            name: "PreschoolClass".into(),
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap_err();
        assert!(err.to_string().contains("StudentProfile.preschool"));
    }

    #[test]
    fn test_alter_to_many_to_many_rejected() {
        let mut state = preschool_state();
        Operation::CreateModel {
            name: "Event".into(),
            fields: vec![
                FieldDef::auto_id(),
                FieldDef::new(
                    "student_user",
                    FieldKind::foreign_key("yoyaku.StudentProfile", OnDelete::Cascade),
                ),
            ],
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();

        let op = Operation::AlterField {
            model_name: "event".into(),
            field: FieldDef::new("student_user", FieldKind::many_to_many("yoyaku.StudentProfile")),
        };
        assert!(matches!(
            op.state_forwards("yoyaku", &mut state),
            Err(StrataError::Validation(_))
        ));
    }

    #[test]
    fn test_rename_model_retargets_relations() {
        let mut state = preschool_state();
        Operation::AddField {
            model_name: "studentprofile".into(),
            field: FieldDef::new(
                "preschool",
                FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
            )
            .nullable(),
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();

        Operation::RenameModel {
            old_name: "PreschoolClass".into(),
            new_name: "Classroom".into(),
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();

        assert!(state.get_model("yoyaku", "preschoolclass").is_none());
        let student = state.model("yoyaku", "studentprofile").unwrap();
        assert_eq!(
            student.field("preschool").unwrap().relation_target(),
            Some("yoyaku.Classroom")
        );
    }

    #[test]
    fn test_rename_field() {
        let mut state = preschool_state();
        Operation::RenameField {
            model_name: "preschoolclass".into(),
            old_name: "limit".into(),
            new_name: "capacity".into(),
        }
        .state_forwards("yoyaku", &mut state)
        .unwrap();
        let model = state.model("yoyaku", "PreschoolClass").unwrap();
        assert!(model.field("capacity").is_some());
        assert!(model.field("limit").is_none());
    }

    #[test]
    fn test_reversibility() {
        let forward_only = Operation::RunSql {
            sql: "UPDATE yoyaku_myuser SET avatar = 'bear'".into(),
            reverse_sql: None,
        };
        assert!(!forward_only.is_reversible());
        assert!(Operation::DeleteModel { name: "X".into() }.is_reversible());
    }

    #[test]
    fn test_name_fragments() {
        let add = Operation::AddField {
            model_name: "myuser".into(),
            field: FieldDef::new("avatar", FieldKind::Char { max_length: 10 }),
        };
        assert_eq!(add.migration_name_fragment().as_deref(), Some("myuser_avatar"));

        let alter = Operation::AlterField {
            model_name: "studentprofile".into(),
            field: FieldDef::new("should_pay_signup_fee", FieldKind::Char { max_length: 30 }),
        };
        assert_eq!(
            alter.migration_name_fragment().as_deref(),
            Some("alter_studentprofile_should_pay_signup_fee")
        );
    }
}
