//! Session store.
//!
//! Small key/value persistence shared between the exam session and the
//! result pages: the test in progress and the latest grading result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::TestDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    ActiveTest,
    LatestResult,
}

impl StoreKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::ActiveTest => "active_test",
            StoreKey::LatestResult => "latest_result",
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn put(&self, key: StoreKey, value: serde_json::Value) -> Result<()>;

    /// Read and clear.
    fn take(&self, key: StoreKey) -> Result<Option<serde_json::Value>>;

    fn peek(&self, key: StoreKey) -> Result<Option<serde_json::Value>>;
}

impl dyn SessionStore {
    pub fn put_typed<T: Serialize>(&self, key: StoreKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("serializing {}", key.as_str()))?;
        self.put(key, value)
    }

    pub fn peek_typed<T: DeserializeOwned>(&self, key: StoreKey) -> Result<Option<T>> {
        self.peek(key)?
            .map(|v| {
                serde_json::from_value(v).with_context(|| format!("decoding {}", key.as_str()))
            })
            .transpose()
    }

    pub fn take_typed<T: DeserializeOwned>(&self, key: StoreKey) -> Result<Option<T>> {
        self.take(key)?
            .map(|v| {
                serde_json::from_value(v).with_context(|| format!("decoding {}", key.as_str()))
            })
            .transpose()
    }
}

/// The test a session is currently running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTest {
    pub definition: TestDefinition,
    pub started_at: DateTime<Utc>,
}

impl ActiveTest {
    pub fn new(definition: &TestDefinition) -> Self {
        Self {
            definition: definition.clone(),
            started_at: Utc::now(),
        }
    }
}

/// What the result pages read after a session completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub test_set_id: String,
    pub answered: usize,
    pub total: usize,
    pub completion_time: u64,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<StoreKey, serde_json::Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn put(&self, key: StoreKey, value: serde_json::Value) -> Result<()> {
        self.entries().insert(key, value);
        Ok(())
    }

    fn take(&self, key: StoreKey) -> Result<Option<serde_json::Value>> {
        Ok(self.entries().remove(&key))
    }

    fn peek(&self, key: StoreKey) -> Result<Option<serde_json::Value>> {
        Ok(self.entries().get(&key).cloned())
    }
}

// ---------------------------------------------------------------------------
// On disk
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    saved_at: DateTime<Utc>,
    value: serde_json::Value,
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

impl SessionStore for FileStore {
    fn put(&self, key: StoreKey, value: serde_json::Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating store directory {}", self.dir.display()))?;
        let path = self.path(key);
        let envelope = Envelope {
            saved_at: Utc::now(),
            value,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "stored {}", key.as_str());
        Ok(())
    }

    fn take(&self, key: StoreKey) -> Result<Option<serde_json::Value>> {
        let value = self.peek(key)?;
        if value.is_some() {
            let path = self.path(key);
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(value)
    }

    fn peek(&self, key: StoreKey) -> Result<Option<serde_json::Value>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let envelope: Envelope = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(envelope.value))
    }
}
