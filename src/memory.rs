//! Long-term memory keyed by user id.
//!
//! The agent only needs to save text and read back an excerpt; how a store
//! condenses or indexes what it keeps is its own business.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AgentError, Result};

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn save(&self, user_id: &str, text: &str) -> Result<()>;

    /// Excerpt for prompts, or `None` when nothing is stored for the user.
    async fn load(&self, user_id: &str) -> Result<Option<String>>;
}

/// Memory file: a JSON object of user id to remembered entries, oldest first.
pub struct FileMemoryStore {
    path: PathBuf,
    max_entries: usize,
    // Serialises read-modify-write cycles within the process.
    lock: AsyncMutex<()>,
}

impl FileMemoryStore {
    pub const DEFAULT_MAX_ENTRIES: usize = 50;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            lock: AsyncMutex::new(()),
        }
    }

    /// Open the store, optionally wiping whatever the file held.
    pub async fn open(path: impl Into<PathBuf>, reset: bool) -> Result<Self> {
        let store = Self::new(path);
        if store.path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(AgentError::configuration(format!(
                "memory file `{}` must be a .json file",
                store.path.display()
            )));
        }
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        if reset {
            store.write(&BTreeMap::new()).await?;
        }
        Ok(store)
    }

    /// Entries kept per user; older ones are dropped first.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(AgentError::Storage(format!(
                    "failed to read memory `{}`: {err}",
                    self.path.display()
                )))
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|err| {
            AgentError::Storage(format!(
                "memory `{}` is not valid JSON: {err}",
                self.path.display()
            ))
        })
    }

    async fn write(&self, entries: &BTreeMap<String, Vec<String>>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, serialized).await.map_err(|err| {
            AgentError::Storage(format!(
                "failed to persist memory `{}`: {err}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn save(&self, user_id: &str, text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        let user_entries = entries.entry(user_id.to_string()).or_default();
        user_entries.push(text.to_string());
        if user_entries.len() > self.max_entries {
            let excess = user_entries.len() - self.max_entries;
            user_entries.drain(..excess);
        }
        self.write(&entries).await
    }

    async fn load(&self, user_id: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let entries = self.read().await?;
        Ok(entries
            .get(user_id)
            .filter(|entries| !entries.is_empty())
            .map(|entries| entries.join("\n")))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, user_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(user_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn save(&self, user_id: &str, text: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AgentError::Storage("memory lock poisoned".into()))?
            .entry(user_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AgentError::Storage("memory lock poisoned".into()))?;
        Ok(entries
            .get(user_id)
            .filter(|entries| !entries.is_empty())
            .map(|entries| entries.join("\n")))
    }
}
