//! A single JSON document on disk with file-lock guarded mutation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long to keep polling for the lock file before giving up.
const LOCK_DEADLINE: Duration = Duration::from_secs(5);
/// Interval between lock acquisition attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors surfaced by the document stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out waiting for lock file {}", .0.display())]
    LockTimeout(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid JSON in {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A JSON document persisted at a fixed path, guarded by a `<path>.lock`
/// file for cross-process exclusion and a process-local mutex for
/// in-process callers.
///
/// Mutations go through [`JsonDocument::with_lock`], which re-reads the
/// document inside the critical section so a committed write from a
/// cooperating process is always observed. Plain reads also re-read from
/// disk and are stale-tolerant.
pub struct JsonDocument<T> {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Clone + Default,
{
    /// Open the document at `path`, creating parent directories and
    /// starting from `T::default()` when no file exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let state = if path.exists() {
            Self::load(&path)?
        } else {
            T::default()
        };

        let lock_path = lock_path_for(&path);
        Ok(Self {
            path,
            lock_path,
            state: Mutex::new(state),
        })
    }

    /// Path of the underlying document file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the document under both locks, then persist.
    ///
    /// On persistence failure the in-memory mutation is discarded (the
    /// on-disk document is reloaded) and the error is returned. The lock
    /// file is released on every path.
    pub async fn with_lock<R>(
        &self,
        op: impl FnOnce(&mut T) -> R,
    ) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        let token = self.acquire_file_lock().await?;

        // Pick up writes committed by other processes while we were not
        // holding the lock.
        if self.path.exists() {
            match Self::load(&self.path) {
                Ok(doc) => *state = doc,
                Err(err) => {
                    self.release_file_lock(&token);
                    return Err(err);
                }
            }
        }

        let result = op(&mut state);

        match Self::persist(&self.path, &state) {
            Ok(()) => {
                self.release_file_lock(&token);
                Ok(result)
            }
            Err(err) => {
                // Discard the mutation: the document on disk is the truth.
                *state = Self::load(&self.path).unwrap_or_default();
                self.release_file_lock(&token);
                Err(err)
            }
        }
    }

    /// Read the document without taking the file lock.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        if self.path.exists() {
            *state = Self::load(&self.path)?;
        }
        Ok(f(&state))
    }

    fn load(path: &Path) -> Result<T, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn persist(path: &Path, doc: &T) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(doc).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        // Write-then-rename so a crash mid-write never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Acquire the lock file by exclusive atomic create, writing a unique
    /// token. Polls until the deadline elapses.
    async fn acquire_file_lock(&self) -> Result<String, StoreError> {
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + LOCK_DEADLINE;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    return Ok(token);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(self.lock_path.clone()));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Delete the lock file, but only if it still carries our token.
    fn release_file_lock(&self, token: &str) {
        let holder = std::fs::read_to_string(&self.lock_path).unwrap_or_default();
        if holder == token {
            if let Err(err) = std::fs::remove_file(&self.lock_path) {
                tracing::warn!("Failed to remove lock file {:?}: {}", self.lock_path, err);
            }
        } else {
            tracing::warn!(
                "Lock file {:?} no longer holds our token; leaving it in place",
                self.lock_path
            );
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    type Doc = HashMap<String, u32>;

    #[tokio::test]
    async fn test_with_lock_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let doc: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();
        doc.with_lock(|d| {
            d.insert("a".to_string(), 1);
        })
        .await
        .unwrap();

        // A fresh handle over the same file sees the committed write.
        let reopened: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();
        let value = reopened.read(|d| d.get("a").copied()).await.unwrap();
        assert_eq!(value, Some(1));
    }

    #[tokio::test]
    async fn test_lock_file_removed_after_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let doc: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();
        doc.with_lock(|d| {
            d.insert("a".to_string(), 1);
        })
        .await
        .unwrap();

        assert!(!dir.path().join("doc.json.lock").exists());
    }

    #[tokio::test]
    async fn test_lock_contention_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        // Simulate another process holding the lock.
        std::fs::write(dir.path().join("doc.json.lock"), "someone-else").unwrap();

        let doc: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(7),
            doc.with_lock(|d| {
                d.insert("a".to_string(), 1);
            }),
        )
        .await
        .expect("lock acquisition should give up before the outer timeout");

        assert!(matches!(result, Err(StoreError::LockTimeout(_))));
        // The foreign lock must not have been deleted.
        assert!(dir.path().join("doc.json.lock").exists());
    }

    #[tokio::test]
    async fn test_two_handles_serialize_over_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let first: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();
        let second: JsonDocument<Doc> = JsonDocument::open(&path).unwrap();

        first
            .with_lock(|d| {
                d.insert("count".to_string(), 1);
            })
            .await
            .unwrap();

        // The second handle observes the first one's committed write.
        second
            .with_lock(|d| {
                let count = d.entry("count".to_string()).or_insert(0);
                *count += 1;
            })
            .await
            .unwrap();

        let count = first.read(|d| d.get("count").copied()).await.unwrap();
        assert_eq!(count, Some(2));
    }
}
