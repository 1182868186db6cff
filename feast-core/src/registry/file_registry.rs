use crate::error::{BackendContext, FeastError, Result};
use crate::registry::registry_store::{RegistryStore, stale};
use crate::registry::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, warn};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry snapshot kept in a local file. Saves go through a temporary sibling file that
/// is renamed over the target, so a failed save never leaves a partial snapshot behind.
///
/// Writers across processes are serialized by a `<file>.lock` sibling created exclusively;
/// the version check and the rename both happen while it is held.
pub struct FileRegistryStore {
    path: PathBuf,
    location: String,
    lock_timeout: Duration,
}

/// Removes the lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!("Failed to release registry lock {}: {}", self.path.display(), err);
        }
    }
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self {
            path,
            location,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long a save waits for another writer's lock before giving up.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(suffix);
        self.path.with_file_name(file_name)
    }

    fn tmp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    async fn lock(&self) -> Result<LockFile> {
        let path = self.lock_path();
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockFile { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(FeastError::backend(
                            format!("Registry {} is locked by another writer", self.location),
                            anyhow::anyhow!("lock file {} still exists", path.display()),
                        ));
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_backend(|| format!("Failed to lock registry {}", self.location));
                }
            }
        }
    }

    async fn read_bytes(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_backend(|| format!("Failed to read registry {}", self.location)),
        }
    }
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
    async fn load(&self) -> Result<RegistrySnapshot> {
        match self.read_bytes().await? {
            Some(bytes) => RegistrySnapshot::decode(&bytes),
            None => {
                debug!("Registry {} does not exist yet", self.location);
                Ok(RegistrySnapshot::default())
            }
        }
    }

    async fn save(&self, snapshot: &RegistrySnapshot, expected_version: u64) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_backend(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let _lock = self.lock().await?;
        let found = match self.read_bytes().await? {
            Some(bytes) => RegistrySnapshot::decode(&bytes)?.version,
            None => 0,
        };
        if found != expected_version {
            return Err(stale(&self.location, expected_version, found));
        }
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, snapshot.encode())
            .await
            .with_backend(|| format!("Failed to write registry {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_backend(|| format!("Failed to replace registry {}", self.location))?;
        debug!(
            "Saved registry {} at version {}",
            self.location, snapshot.version
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_backend(|| format!("Failed to remove registry {}", self.location)),
        }
    }

    fn location(&self) -> &str {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::snapshot::tests::sample_snapshot;
    use anyhow::Result;

    #[tokio::test]
    async fn missing_file_loads_empty_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("registry.pb"));
        assert_eq!(store.load().await?, RegistrySnapshot::default());
        Ok(())
    }

    #[tokio::test]
    async fn save_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("data").join("registry.pb"));
        let mut snapshot = sample_snapshot();
        snapshot.version = 1;
        store.save(&snapshot, 0).await?;
        assert_eq!(store.load().await?, snapshot);
        assert!(!store.tmp_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_version_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("registry.pb"));
        let mut first = sample_snapshot();
        first.version = 1;
        store.save(&first, 0).await?;

        let mut concurrent = RegistrySnapshot::default();
        concurrent.version = 1;
        let err = store.save(&concurrent, 0).await.unwrap_err();
        assert!(matches!(
            err,
            FeastError::StaleRegistry {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(store.load().await?, first);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_saves_of_one_version_admit_one_writer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("registry.pb");
        for round in 0..10u64 {
            let left = FileRegistryStore::new(&path);
            let right = FileRegistryStore::new(&path);
            let mut a = sample_snapshot();
            a.version = round + 1;
            let mut b = RegistrySnapshot::default();
            b.version = round + 1;
            let (ra, rb) = tokio::join!(left.save(&a, round), right.save(&b, round));
            assert!(ra.is_ok() != rb.is_ok());
            let loser = ra.err().or(rb.err());
            assert!(matches!(loser, Some(FeastError::StaleRegistry { .. })));
            assert_eq!(left.load().await?.version, round + 1);
        }
        assert!(!FileRegistryStore::new(&path).lock_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn held_lock_blocks_save() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("registry.pb"))
            .with_lock_timeout(Duration::from_millis(50));
        std::fs::write(store.lock_path(), b"")?;
        let mut snapshot = sample_snapshot();
        snapshot.version = 1;
        let err = store.save(&snapshot, 0).await.unwrap_err();
        assert!(matches!(err, FeastError::Backend { .. }));
        assert_eq!(store.load().await?, RegistrySnapshot::default());

        std::fs::remove_file(store.lock_path())?;
        store.save(&snapshot, 0).await?;
        assert_eq!(store.load().await?, snapshot);
        Ok(())
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("registry.pb"));
        let mut first = sample_snapshot();
        first.version = 1;
        store.save(&first, 0).await?;

        // A directory squatting on the temporary path makes the write fail.
        std::fs::create_dir(store.tmp_path())?;
        let mut second = RegistrySnapshot::default();
        second.version = 2;
        let err = store.save(&second, 1).await.unwrap_err();
        assert!(matches!(err, FeastError::Backend { .. }));
        assert_eq!(store.load().await?, first);
        Ok(())
    }

    #[tokio::test]
    async fn teardown_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileRegistryStore::new(dir.path().join("registry.pb"));
        let mut snapshot = sample_snapshot();
        snapshot.version = 1;
        store.save(&snapshot, 0).await?;
        store.teardown().await?;
        store.teardown().await?;
        assert!(!store.path().exists());
        Ok(())
    }
}
