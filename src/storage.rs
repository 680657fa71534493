// 🗄️ Object Storage - get/put/list over keyed blobs
// Landing, processed and state areas are all object stores

use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub trait ObjectStore: Send + Sync {
    /// Object bytes, or None when the key does not exist
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite an object
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Keys starting with `prefix`, sorted ascending
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

// ============================================================================
// LOCAL DIRECTORY BACKEND
// ============================================================================

/// Objects as files under a root directory; `/` in keys maps to subdirectories
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| PipelineError::storage(root.display().to_string(), e))?;
        Ok(LocalObjectStore { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(PipelineError::storage(key, "invalid object key"));
        }
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PipelineError::storage(dir.display().to_string(), e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::storage(dir.display().to_string(), e))?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if path.extension().map_or(true, |ext| ext != "tmp") {
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::storage(key, e)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::storage(key, e))?;
        }

        // Write-then-rename so readers never see a half-written object
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| PipelineError::storage(key, e))?;
        fs::rename(&tmp, &path).map_err(|e| PipelineError::storage(key, e))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| PipelineError::storage(key, "store lock poisoned"))?;
        Ok(objects.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| PipelineError::storage(key, "store lock poisoned"))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| PipelineError::storage(prefix, "store lock poisoned"))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn ObjectStore) {
        assert_eq!(store.get("currency/a.csv").unwrap(), None);

        store.put("currency/b.csv", b"second").unwrap();
        store.put("currency/a.csv", b"first").unwrap();
        store.put("staff/a.csv", b"other").unwrap();
        store.put("currency/a.csv", b"overwritten").unwrap();

        assert_eq!(store.get("currency/a.csv").unwrap().unwrap(), b"overwritten");
        assert_eq!(
            store.list("currency/").unwrap(),
            vec!["currency/a.csv".to_string(), "currency/b.csv".to_string()]
        );
        assert_eq!(store.list("").unwrap().len(), 3);
        assert!(store.exists("staff/a.csv").unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryObjectStore::new());
    }

    #[test]
    fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).unwrap();
        exercise(&store);
        assert!(dir.path().join("currency").join("a.csv").exists());
    }

    #[test]
    fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(dir.path()).unwrap();
        assert!(store.put("../outside.csv", b"x").is_err());
        assert!(store.get("").is_err());
    }
}
