//! Persisted key-value storage for endpoint selection, the offline queue and
//! cached responses.

pub mod cache;

pub use cache::{CacheEntry, CachedResponse, ResponseCache};

use crate::error::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SERVER_URL_KEY: &str = "server_url";

/// Synchronous JSON store. Implementations must be cheap enough to call while
/// holding no async locks; none of the callers await while using it.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

pub fn load<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(value) => {
            let parsed = serde_json::from_value(value)
                .with_context(|| format!("stored value under `{key}` is malformed"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

pub fn save<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()>
where
    T: Serialize,
{
    let encoded = serde_json::to_value(value)?;
    store.set(key, encoded)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let guard = self.entries.lock().expect("memory store lock poisoned");
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.entries.lock().expect("memory store lock poisoned");
        guard.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self.entries.lock().expect("memory store lock poisoned");
        guard.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let guard = self.entries.lock().expect("memory store lock poisoned");
        Ok(guard.keys().cloned().collect())
    }
}

/// Single JSON document on disk. Every mutation rewrites the document through a
/// temporary sibling file followed by a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("store {} is not valid JSON", path.display()))?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let encoded = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, encoded)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let guard = self.entries.lock().expect("file store lock poisoned");
        Ok(guard.get(key).cloned())
    }

    /// The in-memory map only changes once the document is on disk.
    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.entries.lock().expect("file store lock poisoned");
        let mut next = guard.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self.entries.lock().expect("file store lock poisoned");
        if !guard.contains_key(key) {
            return Ok(());
        }
        let mut next = guard.clone();
        next.remove(key);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let guard = self.entries.lock().expect("file store lock poisoned");
        Ok(guard.keys().cloned().collect())
    }
}
