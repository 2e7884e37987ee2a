use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::credential::IdentityKey;
use crate::token_cache::CachedToken;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("persist error: {0}")]
    Persist(String),
}

/// Backing storage for cached tokens. Loads are best-effort: anything
/// unreadable is reported as absent.
pub trait TokenStore: Send + Sync {
    fn load(&self, key: &IdentityKey) -> Option<CachedToken>;
    fn save(&self, token: &CachedToken) -> Result<(), StoreError>;
    fn remove(&self, key: &IdentityKey) -> Result<(), StoreError>;
}

/// A simple in-memory store, mainly for testing.
pub struct MemoryTokenStore {
    map: std::sync::Mutex<HashMap<IdentityKey, CachedToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self {
            map: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, key: &IdentityKey) -> Option<CachedToken> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn save(&self, token: &CachedToken) -> Result<(), StoreError> {
        self.map
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?
            .insert(token.identity_key.clone(), token.clone());
        Ok(())
    }

    fn remove(&self, key: &IdentityKey) -> Result<(), StoreError> {
        self.map
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?
            .remove(key);
        Ok(())
    }
}

/// JSON file store, owner read/write only on Unix. Writes go through a temp
/// file and a rename so a crash never leaves a half-written cache behind.
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: std::sync::Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> HashMap<IdentityKey, CachedToken> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&s) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable token cache");
                HashMap::new()
            }
        }
    }

    fn write_map(&self, map: &HashMap<IdentityKey, CachedToken>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        }
        let s = serde_json::to_string_pretty(map)
            .map_err(|e| StoreError::Persist(format!("serde: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &s).map_err(|e| StoreError::Persist(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp, perms)
                .map_err(|e| StoreError::Persist(format!("chmod: {}", e)))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Persist(e.to_string()))
    }

    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<IdentityKey, CachedToken>),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?;
        let mut map = self.read_map();
        f(&mut map);
        self.write_map(&map)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, key: &IdentityKey) -> Option<CachedToken> {
        self.read_map().remove(key)
    }

    fn save(&self, token: &CachedToken) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(token.identity_key.clone(), token.clone());
        })
    }

    fn remove(&self, key: &IdentityKey) -> Result<(), StoreError> {
        self.update(|map| {
            map.remove(key);
        })
    }
}
