use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use strata_core::error::{Result, StrataError};
use strata_core::migration::{MigrationGraph, MigrationId, MigrationRecord};
use strata_core::schema::{FieldDef, ModelState};

use crate::autodetect::SchemaDiff;

/// Writes new migration records for model changes.
pub struct MigrationGenerator {
    /// Migrations root; records land in `<output_dir>/<app>/`.
    output_dir: PathBuf,
}

/// A generated, not yet written, record.
#[derive(Debug, Clone)]
pub struct GeneratedMigration {
    pub record: MigrationRecord,
    pub diff: SchemaDiff,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

impl MigrationGenerator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Diff `desired` against the state the graph produces and build the
    /// record that bridges them. `None` when nothing changed.
    pub fn generate(
        &self,
        app: &str,
        graph: &MigrationGraph,
        desired: &[ModelState],
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<GeneratedMigration>> {
        let current = graph.make_state(|_| true)?;
        let diff = SchemaDiff::from_states(app, &current, desired)?;
        if diff.is_empty() {
            return Ok(None);
        }

        let initial = !graph.apps().contains(app);
        let number = graph
            .records()
            .filter(|r| r.app() == app)
            .filter_map(|r| r.id.number())
            .max()
            .map_or(1, |n| n + 1);
        let fragment = match name {
            Some(name) => name.to_string(),
            None => self.generate_name(&diff, initial, now),
        };
        let record_name = format!("{:04}_{}", number, fragment);

        let mut dependencies: BTreeSet<MigrationId> = graph.leaf_nodes(app).into_iter().collect();
        for other in diff.referenced_apps(app) {
            if !graph.apps().contains(&other) {
                return Err(StrataError::NotFound(format!(
                    "models reference app '{}', which has no migrations",
                    other
                )));
            }
            dependencies.extend(graph.leaf_nodes(&other));
        }

        let mut record = MigrationRecord::new(app, record_name.clone());
        record.initial = initial;
        record.dependencies = dependencies.into_iter().collect();
        record.operations = diff.operations();

        Ok(Some(GeneratedMigration {
            path: self.output_dir.join(app).join(format!("{}.toml", record_name)),
            record,
            diff,
            created_at: now,
        }))
    }

    /// Human-readable name fragment, e.g. `preschoolclass` or `myuser_avatar`.
    fn generate_name(&self, diff: &SchemaDiff, initial: bool, now: DateTime<Utc>) -> String {
        if initial {
            return "initial".to_string();
        }
        match diff.entries.as_slice() {
            [only] => only
                .operation
                .migration_name_fragment()
                .unwrap_or_else(|| format!("auto_{}", now.format("%Y%m%d_%H%M"))),
            _ => format!("auto_{}", now.format("%Y%m%d_%H%M")),
        }
    }

    /// Render a record file with its generated-by header.
    pub fn render(&self, migration: &GeneratedMigration) -> Result<String> {
        Ok(format!(
            "# Generated by strata {} on {}\n\n{}",
            env!("CARGO_PKG_VERSION"),
            migration.created_at.format("%Y-%m-%d %H:%M"),
            migration.record.to_toml()?
        ))
    }

    /// Write migration to disk.
    pub fn write_migration(&self, migration: &GeneratedMigration) -> Result<()> {
        if let Some(parent) = migration.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if migration.path.exists() {
            return Err(StrataError::InvalidState(format!(
                "{} already exists",
                migration.path.display()
            )));
        }
        std::fs::write(&migration.path, self.render(migration)?)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default)]
    fields: Vec<FieldDef>,
}

/// Read the desired models of `app` from a TOML file:
///
/// ```toml
/// [[models]]
/// name = "PreschoolClass"
///
/// [[models.fields]]
/// name = "name"
/// kind = "char"
/// max_length = 300
/// ```
pub fn load_models_file(app: &str, path: &Path) -> Result<Vec<ModelState>> {
    let content = std::fs::read_to_string(path)?;
    let file: ModelsFile = toml::from_str(&content).map_err(|e| {
        StrataError::Deserialization(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    Ok(file
        .models
        .into_iter()
        .map(|entry| {
            let mut model = ModelState::new(app, entry.name);
            model.fields = entry.fields;
            model
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::migration::{load_app_records, Operation};
    use strata_core::schema::FieldKind;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 2, 15, 17, 57, 0).unwrap()
    }

    fn base_graph() -> MigrationGraph {
        MigrationGraph::new([MigrationRecord::new("yoyaku", "0026_auto_20200821_0213")
            .initial()
            .operation(Operation::CreateModel {
                name: "MyUser".into(),
                fields: vec![FieldDef::new("username", FieldKind::Char { max_length: 150 })],
            })])
        .unwrap()
    }

    fn my_user(extra: Vec<FieldDef>) -> ModelState {
        let mut model = ModelState::new("yoyaku", "MyUser")
            .with_field(FieldDef::new("username", FieldKind::Char { max_length: 150 }));
        model.fields.extend(extra);
        model
    }

    #[test]
    fn test_no_changes() {
        let generator = MigrationGenerator::new("/tmp/migrations");
        let generated = generator
            .generate("yoyaku", &base_graph(), &[my_user(vec![])], None, now())
            .unwrap();
        assert!(generated.is_none());
    }

    #[test]
    fn test_single_add_is_named_after_the_field() {
        let generator = MigrationGenerator::new("/tmp/migrations");
        let avatar = FieldDef::new("avatar", FieldKind::Char { max_length: 10 })
            .blank()
            .with_choices([("bear", "Bear"), ("cat", "Cat")]);

        let generated = generator
            .generate("yoyaku", &base_graph(), &[my_user(vec![avatar])], None, now())
            .unwrap()
            .unwrap();
        assert_eq!(generated.record.id.name, "0027_myuser_avatar");
        assert_eq!(
            generated.record.dependencies,
            vec![MigrationId::new("yoyaku", "0026_auto_20200821_0213")]
        );
        assert_eq!(
            generated.path,
            PathBuf::from("/tmp/migrations/yoyaku/0027_myuser_avatar.toml")
        );
    }

    #[test]
    fn test_multiple_changes_get_a_timestamp_name() {
        let generator = MigrationGenerator::new("/tmp/migrations");
        let desired = vec![
            my_user(vec![FieldDef::new("age", FieldKind::Integer).nullable()]),
            ModelState::new("yoyaku", "PreschoolClass"),
        ];
        let generated = generator
            .generate("yoyaku", &base_graph(), &desired, None, now())
            .unwrap()
            .unwrap();
        assert_eq!(generated.record.id.name, "0027_auto_20210215_1757");
    }

    #[test]
    fn test_first_record_is_initial() {
        let generator = MigrationGenerator::new("/tmp/migrations");
        let desired = vec![ModelState::new("billing", "Invoice")];
        let generated = generator
            .generate("billing", &base_graph(), &desired, None, now())
            .unwrap()
            .unwrap();
        assert_eq!(generated.record.id.name, "0001_initial");
        assert!(generated.record.initial);
        assert!(generated.record.dependencies.is_empty());
    }

    #[test]
    fn test_write_and_reload() {
        let dir = TempDir::new().unwrap();
        let generator = MigrationGenerator::new(dir.path());
        let models_path = dir.path().join("models.toml");
        std::fs::write(
            &models_path,
            r#"
[[models]]
name = "MyUser"

[[models.fields]]
name = "username"
kind = "char"
max_length = 150

[[models.fields]]
name = "bio"
kind = "text"
blank = true
"#,
        )
        .unwrap();

        let desired = load_models_file("yoyaku", &models_path).unwrap();
        let generated = generator
            .generate("yoyaku", &base_graph(), &desired, Some("myuser_bio"), now())
            .unwrap()
            .unwrap();
        generator.write_migration(&generated).unwrap();

        let written = std::fs::read_to_string(&generated.path).unwrap();
        assert!(written.starts_with("# Generated by strata "));

        let records = load_app_records("yoyaku", &dir.path().join("yoyaku")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.name, "0027_myuser_bio");
        assert_eq!(records[0].operations, generated.record.operations);

        let again = generator.write_migration(&generated);
        assert!(matches!(again, Err(StrataError::InvalidState(_))));
    }
}
