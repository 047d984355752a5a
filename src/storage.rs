//! Storage adapters for the resiliency cache

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Storage keys
pub mod keys {
    pub const DEVICE_ID: &str = concat!("checkstand:", "device_id");
    pub const USER_ID: &str = concat!("checkstand:", "user_id");
    pub const SUBMITTED_TOKENS: &str = concat!("checkstand:", "submitted_tokens");
    pub const ENTITLEMENTS: &str = concat!("checkstand:", "entitlements");
    pub const STAGED_PURCHASES: &str = concat!("checkstand:", "staged_purchases");
    pub const FIRST_SEEN: &str = concat!("checkstand:", "first_seen");
}

/// Storage adapter trait for custom storage implementations
pub trait StorageAdapter: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &str) -> Option<String>;

    /// Set a value by key
    fn set(&self, key: &str, value: &str);

    /// Remove a value by key
    fn remove(&self, key: &str);
}

/// Read a JSON-encoded value; `None` on missing or undecodable data.
pub fn get_json<T: DeserializeOwned>(storage: &dyn StorageAdapter, key: &str) -> Option<T> {
    let raw = storage.get(key)?;
    serde_json::from_str(&raw).ok()
}

/// Write a JSON-encoded value; silently drops values that fail to encode.
pub fn set_json<T: Serialize>(storage: &dyn StorageAdapter, key: &str, value: &T) {
    if let Ok(raw) = serde_json::to_string(value) {
        storage.set(key, &raw);
    }
}

/// In-memory storage adapter (default; nothing survives the process)
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.data.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut data) = self.data.write() {
            data.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut data) = self.data.write() {
            data.remove(key);
        }
    }
}

/// File-based storage adapter
///
/// Stores SDK state in `checkstand.json` within the specified directory.
pub struct FileStorage {
    path: std::path::PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    ///
    /// The directory must exist and be writable.
    ///
    /// # Returns
    /// `None` if the directory doesn't exist or isn't accessible.
    pub fn new(storage_dir: &Path) -> Option<Self> {
        if !storage_dir.is_dir() {
            return None;
        }

        let path = storage_dir.join("checkstand.json");

        let cache = if path.exists() {
            let contents = std::fs::read_to_string(&path).ok()?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Some(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn save(&self) {
        if let Ok(cache) = self.cache.read() {
            if let Ok(contents) = serde_json::to_string_pretty(&*cache) {
                let _ = std::fs::write(&self.path, contents);
            }
        }
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key.to_string(), value.to_string());
        }
        self.save();
    }

    fn remove(&self, key: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(key);
        }
        self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k"), None);
        storage.set("k", "v");
        assert_eq!(storage.get("k"), Some("v".to_string()));
        storage.remove("k");
        assert_eq!(storage.get("k"), None);
    }

    #[test]
    fn test_json_helpers() {
        let storage = MemoryStorage::new();
        let tokens: HashSet<String> = ["t1".to_string(), "t2".to_string()].into();
        set_json(&storage, keys::SUBMITTED_TOKENS, &tokens);
        let loaded: HashSet<String> = get_json(&storage, keys::SUBMITTED_TOKENS).unwrap();
        assert_eq!(loaded, tokens);
    }

    #[test]
    fn test_json_helper_ignores_garbage() {
        let storage = MemoryStorage::new();
        storage.set(keys::SUBMITTED_TOKENS, "not json");
        let loaded: Option<HashSet<String>> = get_json(&storage, keys::SUBMITTED_TOKENS);
        assert!(loaded.is_none());
    }
}
