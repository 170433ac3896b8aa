use std::path::Path;

use tracing::debug;

use super::record::{MigrationId, MigrationRecord};
use crate::error::{Result, StrataError};

/// Load migration records from a directory.
///
/// The layout is one subdirectory per namespace with one TOML file per record:
/// - `migrations/yoyaku/0001_initial.toml`
/// - `migrations/yoyaku/0027_myuser_avatar.toml`
///
/// The directory name is the namespace and the file stem is the record name.
/// Records are returned sorted by id; ordering by dependency is the graph's job.
pub fn load_records_from_dir(dir: &Path) -> Result<Vec<MigrationRecord>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut records = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            debug!("Skipping non-directory entry {:?}", path);
            continue;
        }

        let app = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| StrataError::Config(format!("Invalid namespace directory: {:?}", path)))?
            .to_string();

        records.extend(load_app_records(&app, &path)?);
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));

    debug!("Loaded {} migration records", records.len());
    Ok(records)
}

/// Load the records of a single namespace directory.
pub fn load_app_records(app: &str, dir: &Path) -> Result<Vec<MigrationRecord>> {
    let mut records = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map(|e| e == "toml").unwrap_or(false) {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| StrataError::Config("Invalid migration filename".into()))?
                .to_string();

            let content = std::fs::read_to_string(&path)?;
            records.push(MigrationRecord::from_toml(MigrationId::new(app, name), &content)?);
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(load_records_from_dir(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_load_from_nonexistent_dir() {
        let records = load_records_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_load_sorted_and_namespaced() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("yoyaku");
        fs::create_dir(&app).unwrap();

        fs::write(
            app.join("0002_second.toml"),
            "dependencies = [\"yoyaku.0001_first\"]\n",
        )
        .unwrap();
        fs::write(app.join("0001_first.toml"), "initial = true\n").unwrap();
        fs::write(app.join("notes.txt"), "not a migration").unwrap();
        fs::write(dir.path().join("stray.toml"), "").unwrap();

        let records = load_records_from_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, MigrationId::new("yoyaku", "0001_first"));
        assert!(records[0].initial);
        assert_eq!(records[1].dependencies, vec![MigrationId::new("yoyaku", "0001_first")]);
    }

    #[test]
    fn test_malformed_record_names_the_file() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("yoyaku");
        fs::create_dir(&app).unwrap();
        fs::write(app.join("0001_bad.toml"), "dependencies = [\"nodot\"]\n").unwrap();

        let err = load_records_from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("yoyaku.0001_bad"));
    }
}
