use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use strata_core::error::{Result, StrataError};
use strata_core::migration::MigrationId;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AppliedMigration, AppliedSet, BoxFuture, MigrationLock};

/// Applied set persisted as a JSON array.
///
/// Writes go to a sibling temp file that is renamed over the original.
#[derive(Debug, Clone)]
pub struct JsonAppliedSet {
    path: PathBuf,
}

impl JsonAppliedSet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<AppliedMigration>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            StrataError::Deserialization(format!(
                "applied set {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn write(&self, entries: &[AppliedMigration]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entries)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn add(&self, id: &MigrationId, run_id: Uuid) -> Result<()> {
        let mut entries = self.read().await?;
        if entries.iter().any(|a| &a.id == id) {
            return Err(StrataError::Integrity(format!(
                "migration {} is already recorded as applied",
                id
            )));
        }
        entries.push(AppliedMigration::new(id.clone(), run_id));
        self.write(&entries).await
    }

    async fn remove(&self, id: &MigrationId) -> Result<()> {
        let mut entries = self.read().await?;
        entries.retain(|a| &a.id != id);
        self.write(&entries).await
    }
}

impl AppliedSet for JsonAppliedSet {
    fn load(&mut self) -> BoxFuture<'_, Vec<AppliedMigration>> {
        Box::pin(self.read())
    }

    fn mark_applied<'a>(&'a mut self, id: &'a MigrationId, run_id: Uuid) -> BoxFuture<'a, ()> {
        Box::pin(self.add(id, run_id))
    }

    fn mark_unapplied<'a>(&'a mut self, id: &'a MigrationId) -> BoxFuture<'a, ()> {
        Box::pin(self.remove(id))
    }
}

/// Exclusive lock file created with `create_new`.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: false,
        }
    }

    async fn acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.held = true;

        let owner = format!("pid={}\nacquired_at={}\n", std::process::id(), Utc::now().to_rfc3339());
        file.write_all(owner.as_bytes()).await?;
        debug!(path = %self.path.display(), "Migration lock acquired");
        Ok(true)
    }

    async fn unlock(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Migration lock released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl MigrationLock for FileLock {
    fn try_acquire(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.acquire())
    }

    fn release(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.unlock())
    }

    fn describe(&self) -> String {
        format!("lock file {}", self.path.display())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove lock file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_applied_file_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("applied.json");
        let id = MigrationId::new("yoyaku", "0027_myuser_avatar");

        let mut set = JsonAppliedSet::new(&path);
        assert!(set.load().await.unwrap().is_empty());
        set.mark_applied(&id, Uuid::new_v4()).await.unwrap();

        let mut reopened = JsonAppliedSet::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, id);
        assert!(loaded[0].run_id.is_some());

        reopened.mark_unapplied(&id).await.unwrap();
        assert!(set.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_applied_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("applied.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonAppliedSet::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StrataError::Deserialization(_)));
    }

    #[tokio::test]
    async fn test_lock_file_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".strata.lock");

        let mut first = FileLock::new(&path);
        let mut second = FileLock::new(&path);
        let acquired = tokio_test::assert_ok!(first.try_acquire().await);
        assert!(acquired);
        assert!(path.exists());
        assert!(!second.try_acquire().await.unwrap());

        first.release().await.unwrap();
        assert!(!path.exists());
        assert!(second.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".strata.lock");
        {
            let mut lock = FileLock::new(&path);
            assert!(lock.try_acquire().await.unwrap());
        }
        assert!(!path.exists());
    }
}
