use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Opaque reference to a stored blob: a relative, `/`-separated key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectRef(String);

impl ObjectRef {
    /// Validates `key`: relative, no empty, `.` or `..` segments.
    pub fn new(key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && !key.contains('\\')
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        if valid {
            Ok(Self(key))
        } else {
            Err(StorageError::InvalidPath(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ObjectRef {
    type Error = StorageError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

impl From<ObjectRef> for String {
    fn from(object: ObjectRef) -> Self {
        object.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob storage for page renders, OCR documents and overlays.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectRef, StorageError>;
    fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError>;
    fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError>;
}

/// Filesystem-backed store. Writes go to a temp file in the target
/// directory and are renamed into place, so readers never observe a
/// partially written object.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        ensure_directory(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stored object.
    pub fn path_of(&self, object: &ObjectRef) -> PathBuf {
        let mut path = self.root.clone();
        for segment in object.as_str().split('/') {
            path.push(segment);
        }
        path
    }
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectRef, StorageError> {
        let object = ObjectRef::new(key)?;
        let target = self.path_of(&object);

        let dir = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(key.to_string()))?;
        ensure_directory(dir)?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidPath(key.to_string()))?;
        let temp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &target)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StorageError::WriteFile {
                path: target,
                source: e,
            });
        }

        log::debug!("Stored object {} ({} bytes)", object, bytes.len());
        Ok(object)
    }

    fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(object);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(object.to_string())
            } else {
                StorageError::ReadFile { path, source: e }
            }
        })
    }

    fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        Ok(self.path_of(object).is_file())
    }
}

/// In-process store for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectRef, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<ObjectRef> {
        let mut keys: Vec<ObjectRef> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ObjectRef, StorageError> {
        let object = ObjectRef::new(key)?;
        self.objects
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(object.clone(), bytes.to_vec());
        Ok(object)
    }

    fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(object)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(object.to_string()))
    }

    fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(object))
    }
}
