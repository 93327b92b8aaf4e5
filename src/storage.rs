use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Well-known key under which the conversation id is stored.
pub const CONVERSATION_KEY: &str = "cid";

/// Durable storage for the current conversation id.
pub trait ConversationStore: Send + Sync {
    /// Read the persisted id, if any.
    fn load(&self) -> Result<Option<String>>;

    /// Persist `id`, replacing any previous value.
    fn save(&self, id: &str) -> Result<()>;
}

/// JSON key/value file, e.g. `~/.tutor-chat/state.json`.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", self.path.display()))
    }
}

impl ConversationStore for FileStore {
    fn load(&self) -> Result<Option<String>> {
        let entries = self.read_entries()?;
        Ok(entries
            .get(CONVERSATION_KEY)
            .filter(|id| !id.trim().is_empty())
            .cloned())
    }

    fn save(&self, id: &str) -> Result<()> {
        // Keep whatever else lives in the file; an unreadable file is replaced.
        let mut entries = self.read_entries().unwrap_or_default();
        entries.insert(CONVERSATION_KEY.to_string(), id.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let content =
            serde_json::to_string_pretty(&entries).context("Failed to serialize state")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))?;
        Ok(())
    }
}

/// Process-local store. Share it behind an `Arc` to simulate a reload.
#[derive(Default)]
pub struct MemoryStore {
    value: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: &str) -> Self {
        Self {
            value: Mutex::new(Some(id.to_string())),
        }
    }
}

impl ConversationStore for MemoryStore {
    fn load(&self) -> Result<Option<String>> {
        let guard = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("conversation store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, id: &str) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("conversation store lock poisoned"))?;
        *guard = Some(id.to_string());
        Ok(())
    }
}
