use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{apply_edits, select, Edit, KeyValueStore, StoreError};

/// Application name used for the data directory
const APP_NAME: &str = "gridee";

/// Preferences file name inside the data directory
const PREFS_FILE: &str = "gridee_auth_prefs.json";

/// Key-value store backed by a single JSON object on disk.
///
/// Each commit reads the file, applies the batch and writes the result to a
/// uniquely named sibling temp file (mode 0600 on unix) that is then renamed
/// over the original, so other readers observe either the old map or the new
/// one. Concurrent writers from other processes are last-write-wins.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the platform data directory, e.g.
    /// `~/.local/share/gridee/gridee_auth_prefs.json`.
    pub fn open_default() -> Result<Self, StoreError> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not find data directory",
            ))
        })?;
        Ok(Self::new(data_dir.join(APP_NAME).join(PREFS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let contents = serde_json::to_string_pretty(map)?;
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_map()?.remove(key))
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(select(&self.read_map()?, keys))
    }

    fn commit(&self, edits: Vec<Edit>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        apply_edits(&mut map, edits);
        self.write_map(&map)?;
        debug!(path = %self.path.display(), entries = map.len(), "Preferences file written");
        Ok(())
    }
}
