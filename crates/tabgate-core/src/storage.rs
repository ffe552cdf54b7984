//! Persistent key-value state shared with the extension shell.
//!
//! The core only needs read/write/remove of JSON values with last-writer-wins
//! per key. [`FileStore`] persists everything as one JSON document under the
//! gateway home directory; [`MemoryStore`] backs tests and embedders that
//! bring their own persistence.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::Value;

/// Well-known storage keys.
pub mod keys {
    /// `{providerId → {apiKey, ...}}`
    pub const API_CREDENTIALS: &str = "api_credentials";
    /// `{providerId → {defaults, models: {modelId → settings}}}`
    pub const MODEL_PARAMS: &str = "model_params";
    /// `{tabId → {providerId → modelId}}`
    pub const TAB_MODEL_PREFS: &str = "tab_model_prefs";
    /// `{providerId → modelId}` (sidebar only)
    pub const SIDEBAR_MODEL_PREF: &str = "sidebar_model_pref";
    /// Last streaming-response record, keyed by stream id
    pub const STREAMING_RESPONSE: &str = "streaming_response";
    /// Process-wide error field; cleared on success, set on failure
    pub const API_ERROR: &str = "api_error";
}

/// Key-value persistence contract.
///
/// Writes must be atomic per key; the gateway assumes last-writer-wins and
/// nothing stronger.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    fn read(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the value could not be persisted.
    fn write(&self, key: &str, value: Value) -> Result<()>;

    /// Removes the value stored under `key`. Missing keys are not an error.
    ///
    /// # Errors
    /// Returns an error if the removal could not be persisted.
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store for tests and embedders with external persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("store lock poisoned").get(key).cloned()
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().expect("store lock poisoned").remove(key);
        Ok(())
    }
}

/// File-backed store holding one JSON document.
///
/// The document may contain credentials, so it is written with restricted
/// permissions (0600) on unix.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_document(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read store from {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store at {}", self.path.display()))
    }

    fn save_document(&self, document: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(document).context("Failed to serialize store")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, contents)
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> Option<Value> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.load_document().ok()?.remove(key)
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut document = self.load_document()?;
        document.insert(key.to_string(), value);
        self.save_document(&document)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut document = self.load_document()?;
        if document.remove(key).is_some() {
            self.save_document(&document)?;
        }
        Ok(())
    }
}
