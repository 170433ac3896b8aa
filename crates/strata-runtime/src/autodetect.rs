use std::collections::{BTreeSet, HashMap};

use strata_core::error::Result;
use strata_core::migration::Operation;
use strata_core::schema::{resolve_model_ref, FieldDef, ModelState, ProjectState};

/// Operations that take a namespace from its replayed state to a desired
/// model set.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Changes in application order.
    pub entries: Vec<DiffEntry>,
}

/// A single diff entry.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub action: DiffAction,
    /// Affected model name.
    pub model_name: String,
    /// Human-readable description.
    pub details: String,
    pub operation: Operation,
}

/// Type of schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    CreateModel,
    DeleteModel,
    AddField,
    RemoveField,
    AlterField,
}

impl SchemaDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the models of `app` in `current` to `desired`.
    ///
    /// Model renames are not detected; they show up as a delete plus a create.
    pub fn from_states(app: &str, current: &ProjectState, desired: &[ModelState]) -> Result<Self> {
        let desired: Vec<ModelState> = desired
            .iter()
            .cloned()
            .map(|mut model| {
                model.app = app.to_string();
                model.ensure_primary_key();
                model
            })
            .collect();
        for model in &desired {
            model.validate()?;
        }

        let existing: HashMap<String, &ModelState> =
            current.models_in(app).map(|m| (m.name_lower(), m)).collect();
        let wanted: BTreeSet<String> = desired.iter().map(|m| m.name_lower()).collect();

        let mut diff = Self::new();

        let new_models: Vec<&ModelState> = desired
            .iter()
            .filter(|m| !existing.contains_key(&m.name_lower()))
            .collect();
        diff.create_models(app, &new_models);

        for model in desired.iter().filter(|m| existing.contains_key(&m.name_lower())) {
            if let Some(old) = existing.get(&model.name_lower()) {
                diff.compare_fields(old, model);
            }
        }

        let mut removed: Vec<&ModelState> = current
            .models_in(app)
            .filter(|m| !wanted.contains(&m.name_lower()))
            .collect();
        removed.sort_by_key(|m| m.name_lower());
        diff.delete_models(app, &removed);

        Ok(diff)
    }

    /// Create new models so that relation targets exist first. Relations that
    /// form a cycle among new models are split off into `AddField`s.
    fn create_models(&mut self, app: &str, models: &[&ModelState]) {
        let new_names: BTreeSet<String> = models.iter().map(|m| m.name_lower()).collect();
        let mut created: BTreeSet<String> = BTreeSet::new();
        let mut remaining: Vec<&ModelState> = models.to_vec();
        let mut deferred: Vec<(String, FieldDef)> = Vec::new();

        let pending_targets = |model: &ModelState, created: &BTreeSet<String>| -> Vec<String> {
            model
                .fields
                .iter()
                .filter_map(|f| local_target(app, f))
                .filter(|t| *t != model.name_lower() && new_names.contains(t) && !created.contains(t))
                .collect()
        };

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|m| pending_targets(m, &created).is_empty());

            let (model, split) = match ready {
                Some(index) => (remaining.remove(index), Vec::new()),
                None => {
                    let model = remaining.remove(0);
                    let blocked = pending_targets(model, &created);
                    (model, blocked)
                }
            };

            let mut fields = Vec::new();
            for field in &model.fields {
                match local_target(app, field) {
                    Some(target) if split.contains(&target) => {
                        deferred.push((model.name.clone(), field.clone()))
                    }
                    _ => fields.push(field.clone()),
                }
            }

            created.insert(model.name_lower());
            self.push(
                DiffAction::CreateModel,
                &model.name,
                format!("Create model {}", model.name),
                Operation::CreateModel {
                    name: model.name.clone(),
                    fields,
                },
            );
        }

        for (model_name, field) in deferred {
            self.push(
                DiffAction::AddField,
                &model_name,
                format!("Add field {} to {}", field.name, model_name),
                Operation::AddField { model_name: model_name.clone(), field },
            );
        }
    }

    fn compare_fields(&mut self, old: &ModelState, new: &ModelState) {
        let name = &new.name;
        let mut removals = Vec::new();

        for field in &new.fields {
            if old.field(&field.name).is_none() {
                self.push(
                    DiffAction::AddField,
                    name,
                    format!("Add field {} to {}", field.name, name),
                    Operation::AddField {
                        model_name: name.clone(),
                        field: field.clone(),
                    },
                );
            }
        }

        for field in &new.fields {
            let Some(previous) = old.field(&field.name) else {
                continue;
            };
            if previous == field {
                continue;
            }
            if previous.is_many_to_many() != field.is_many_to_many() {
                // No in-place conversion between a column and a join table.
                removals.push(field.name.clone());
                self.push(
                    DiffAction::RemoveField,
                    name,
                    format!("Remove field {} from {}", field.name, name),
                    Operation::RemoveField {
                        model_name: name.clone(),
                        name: field.name.clone(),
                    },
                );
                self.push(
                    DiffAction::AddField,
                    name,
                    format!("Add field {} to {}", field.name, name),
                    Operation::AddField {
                        model_name: name.clone(),
                        field: field.clone(),
                    },
                );
                continue;
            }
            self.push(
                DiffAction::AlterField,
                name,
                format!("Alter field {} on {}", field.name, name),
                Operation::AlterField {
                    model_name: name.clone(),
                    field: field.clone(),
                },
            );
        }

        for field in &old.fields {
            if new.field(&field.name).is_none() && !removals.contains(&field.name) {
                self.push(
                    DiffAction::RemoveField,
                    name,
                    format!("Remove field {} from {}", field.name, name),
                    Operation::RemoveField {
                        model_name: name.clone(),
                        name: field.name.clone(),
                    },
                );
            }
        }
    }

    /// Drop relations between removed models first, then the models.
    fn delete_models(&mut self, app: &str, models: &[&ModelState]) {
        let doomed: BTreeSet<String> = models.iter().map(|m| m.name_lower()).collect();

        for model in models {
            for field in &model.fields {
                let Some(target) = local_target(app, field) else {
                    continue;
                };
                if target != model.name_lower() && doomed.contains(&target) {
                    self.push(
                        DiffAction::RemoveField,
                        &model.name,
                        format!("Remove field {} from {}", field.name, model.name),
                        Operation::RemoveField {
                            model_name: model.name.clone(),
                            name: field.name.clone(),
                        },
                    );
                }
            }
        }

        for model in models {
            self.push(
                DiffAction::DeleteModel,
                &model.name,
                format!("Delete model {}", model.name),
                Operation::DeleteModel {
                    name: model.name.clone(),
                },
            );
        }
    }

    fn push(&mut self, action: DiffAction, model_name: &str, details: String, operation: Operation) {
        self.entries.push(DiffEntry {
            action,
            model_name: model_name.to_string(),
            details,
            operation,
        });
    }

    /// Check if there are any changes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.entries.iter().map(|e| e.operation.clone()).collect()
    }

    /// Namespaces other than `app` that the diff's relations point at.
    pub fn referenced_apps(&self, app: &str) -> BTreeSet<String> {
        let mut apps = BTreeSet::new();
        for entry in &self.entries {
            let fields: Vec<&FieldDef> = match &entry.operation {
                Operation::CreateModel { fields, .. } => fields.iter().collect(),
                Operation::AddField { field, .. } | Operation::AlterField { field, .. } => vec![field],
                _ => Vec::new(),
            };
            for field in fields {
                if let Some(target) = field.relation_target() {
                    let (target_app, _) = resolve_model_ref(target, app);
                    if target_app != app {
                        apps.insert(target_app);
                    }
                }
            }
        }
        apps
    }
}

/// Lowercase model name a relation field targets within `app`.
fn local_target(app: &str, field: &FieldDef) -> Option<String> {
    let target = field.relation_target()?;
    let (target_app, model) = resolve_model_ref(target, app);
    (target_app == app).then_some(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::schema::{FieldKind, OnDelete};

    fn state(models: Vec<ModelState>) -> ProjectState {
        let mut state = ProjectState::new();
        for mut model in models {
            model.ensure_primary_key();
            state.add_model(model).unwrap();
        }
        state
    }

    fn student_profile() -> ModelState {
        ModelState::new("yoyaku", "StudentProfile").with_field(FieldDef::new(
            "should_pay_signup_fee",
            FieldKind::Char { max_length: 30 },
        ))
    }

    #[test]
    fn test_no_changes() {
        let current = state(vec![student_profile()]);
        let diff = SchemaDiff::from_states("yoyaku", &current, &[student_profile()]).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_new_model_is_created_before_its_referrer() {
        let current = state(vec![student_profile()]);
        let desired = vec![
            student_profile().with_field(
                FieldDef::new(
                    "preschool",
                    FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::SetNull),
                )
                .nullable()
                .blank(),
            ),
            ModelState::new("yoyaku", "PreschoolClass")
                .with_field(FieldDef::new("name", FieldKind::Char { max_length: 300 }))
                .with_field(FieldDef::new("limit", FieldKind::Integer)),
        ];

        let diff = SchemaDiff::from_states("yoyaku", &current, &desired).unwrap();
        let actions: Vec<_> = diff.entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![DiffAction::CreateModel, DiffAction::AddField]);
        assert_eq!(diff.entries[0].model_name, "PreschoolClass");
        assert_eq!(diff.entries[1].details, "Add field preschool to StudentProfile");
    }

    #[test]
    fn test_cyclic_relations_are_deferred() {
        let desired = vec![
            ModelState::new("yoyaku", "Event").with_field(
                FieldDef::new("host", FieldKind::foreign_key("yoyaku.Teacher", OnDelete::Cascade)),
            ),
            ModelState::new("yoyaku", "Teacher").with_field(
                FieldDef::new("favourite", FieldKind::foreign_key("yoyaku.Event", OnDelete::SetNull))
                    .nullable(),
            ),
        ];

        let diff = SchemaDiff::from_states("yoyaku", &ProjectState::new(), &desired).unwrap();
        let ops = diff.operations();
        assert_eq!(ops.len(), 3);
        match &ops[0] {
            Operation::CreateModel { name, fields } => {
                assert_eq!(name, "Event");
                assert!(fields.iter().all(|f| f.name != "host"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&ops[1], Operation::CreateModel { name, .. } if name == "Teacher"));
        assert!(matches!(&ops[2], Operation::AddField { field, .. } if field.name == "host"));

        let mut replay = ProjectState::new();
        for op in &ops {
            op.state_forwards("yoyaku", &mut replay).unwrap();
        }
        assert!(replay.model("yoyaku", "Event").unwrap().field("host").is_some());
    }

    #[test]
    fn test_alter_and_remove() {
        let current = state(vec![student_profile()
            .with_field(FieldDef::new("nickname", FieldKind::Char { max_length: 20 }))]);
        let desired = vec![ModelState::new("yoyaku", "StudentProfile").with_field(
            FieldDef::new("should_pay_signup_fee", FieldKind::Char { max_length: 30 })
                .with_default("referral"),
        )];

        let diff = SchemaDiff::from_states("yoyaku", &current, &desired).unwrap();
        let actions: Vec<_> = diff.entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![DiffAction::AlterField, DiffAction::RemoveField]);
    }

    #[test]
    fn test_deleting_related_models_drops_links_first() {
        let current = state(vec![
            ModelState::new("yoyaku", "PreschoolClass"),
            ModelState::new("yoyaku", "Enrollment").with_field(FieldDef::new(
                "preschool",
                FieldKind::foreign_key("yoyaku.PreschoolClass", OnDelete::Cascade),
            )),
        ]);

        let diff = SchemaDiff::from_states("yoyaku", &current, &[]).unwrap();
        let mut replay = current.clone();
        for op in diff.operations() {
            op.state_forwards("yoyaku", &mut replay).unwrap();
        }
        assert!(replay.is_empty());
    }

    #[test]
    fn test_referenced_apps() {
        let desired = vec![ModelState::new("billing", "Invoice").with_field(FieldDef::new(
            "student",
            FieldKind::foreign_key("yoyaku.StudentProfile", OnDelete::Protect),
        ))];
        let diff = SchemaDiff::from_states("billing", &ProjectState::new(), &desired).unwrap();
        assert_eq!(
            diff.referenced_apps("billing").into_iter().collect::<Vec<_>>(),
            vec!["yoyaku".to_string()]
        );
    }
}
