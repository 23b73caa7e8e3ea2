//! Storage for the suspend snapshot.
//!
//! The collector writes two documents per suspended process instance:
//! [`STATE_FILENAME`] holds the execution log and [`FRAMES_FILENAME`] holds the
//! frame side-table. Both are opaque bytes to the storage layer.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::{Result, TelemetryError};

/// Execution log document.
pub const STATE_FILENAME: &str = "opentelemetry.json";

/// Frame side-table document.
pub const FRAMES_FILENAME: &str = "opentelemetry-frames.json";

/// Process-state storage provided by the host.
pub trait PersistenceService: Send + Sync {
    fn persist_file(&self, name: &str, contents: &[u8]) -> Result<()>;

    /// `Ok(None)` when nothing was stored under `name`.
    fn load_persisted_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Removing a missing file is not an error.
    fn remove_persisted_file(&self, name: &str) -> Result<()>;
}

/// Stores each document as a file in one directory per process instance.
#[derive(Debug, Clone)]
pub struct DirPersistence {
    root: PathBuf,
}

impl DirPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let candidate = Path::new(name);
        if name.is_empty() || candidate.components().count() != 1 || candidate.is_absolute() {
            return Err(TelemetryError::Persistence(format!(
                "invalid persisted file name '{name}'"
            )));
        }
        Ok(self.root.join(candidate))
    }
}

impl PersistenceService for DirPersistence {
    fn persist_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.root)?;

        // write next to the target so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| {
            TelemetryError::Persistence(format!("failed to persist {}: {}", path.display(), e.error))
        })?;

        debug!(path = %path.display(), bytes = contents.len(), "Persisted telemetry state");
        Ok(())
    }

    fn load_persisted_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_persisted_file(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps documents in memory. Useful for hosts that persist process state
/// themselves, and for tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

impl PersistenceService for MemoryPersistence {
    fn persist_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    fn load_persisted_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    fn remove_persisted_file(&self, name: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DirPersistence::new(dir.path().join("instance"));

        assert_eq!(store.load_persisted_file(STATE_FILENAME).unwrap(), None);

        store.persist_file(STATE_FILENAME, b"{\"a\":1}").unwrap();
        assert_eq!(
            store.load_persisted_file(STATE_FILENAME).unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );

        // overwrite replaces the whole document
        store.persist_file(STATE_FILENAME, b"{}").unwrap();
        assert_eq!(
            store.load_persisted_file(STATE_FILENAME).unwrap().as_deref(),
            Some(&b"{}"[..])
        );

        store.remove_persisted_file(STATE_FILENAME).unwrap();
        store.remove_persisted_file(STATE_FILENAME).unwrap();
        assert_eq!(store.load_persisted_file(STATE_FILENAME).unwrap(), None);
    }

    #[test]
    fn test_dir_persistence_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = DirPersistence::new(dir.path());
        store.persist_file(FRAMES_FILENAME, b"{\"frames\":[]}").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![FRAMES_FILENAME.to_string()]);
    }

    #[test]
    fn test_dir_persistence_rejects_paths() {
        let dir = TempDir::new().unwrap();
        let store = DirPersistence::new(dir.path());
        for name in ["", "../escape.json", "nested/state.json"] {
            let err = store.persist_file(name, b"x").unwrap_err();
            assert!(matches!(err, TelemetryError::Persistence(_)), "{name}");
        }
    }

    #[test]
    fn test_memory_persistence() {
        let store = MemoryPersistence::new();
        store.persist_file(STATE_FILENAME, b"1").unwrap();
        assert!(store.contains(STATE_FILENAME));
        store.remove_persisted_file(STATE_FILENAME).unwrap();
        assert!(!store.contains(STATE_FILENAME));
    }
}
