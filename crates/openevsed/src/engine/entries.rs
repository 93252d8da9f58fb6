//! Persistent store of config entries.
//!
//! Entries live in memory in a `DashMap` and are written back as a single JSON
//! document after every change. Writes go to a temporary file that is then
//! renamed over the previous copy.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

const STORE_VERSION: u32 = 1;

/// A configured instance of an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
    pub unique_id: Option<String>,
    pub source: String,
    pub version: u32,
}

impl ConfigEntry {
    pub fn new(
        domain: impl Into<String>,
        title: impl Into<String>,
        data: Map<String, Value>,
        source: impl Into<String>,
        version: u32,
    ) -> Self {
        Self {
            entry_id: ulid::Ulid::new().to_string().to_lowercase(),
            domain: domain.into(),
            title: title.into(),
            data,
            options: Map::new(),
            unique_id: None,
            source: source.into(),
            version,
        }
    }

    /// Look up a setting, preferring options over data.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.options.get(key).or_else(|| self.data.get(key))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Config entry store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config entry store is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config entry {0} not found")]
    NotFound(String),
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<ConfigEntry>,
}

pub struct ConfigEntries {
    entries: DashMap<String, ConfigEntry>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl ConfigEntries {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Load entries from `path`. A missing file is an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = DashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: StoreFile = serde_json::from_str(&content)?;
                for entry in file.entries {
                    entries.insert(entry.entry_id.clone(), entry);
                }
                info!(
                    "Loaded {} config entries from {}",
                    entries.len(),
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config entries at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            entries,
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|e| e.value().clone())
    }

    /// All entries ordered by id (ULIDs sort by creation time).
    pub fn all(&self) -> Vec<ConfigEntry> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        all
    }

    pub fn by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.all()
            .into_iter()
            .filter(|e| e.domain == domain)
            .collect()
    }

    pub async fn add(&self, entry: ConfigEntry) -> Result<ConfigEntry, StoreError> {
        info!("Adding config entry {} ({})", entry.title, entry.entry_id);
        self.entries.insert(entry.entry_id.clone(), entry.clone());
        self.save().await?;
        Ok(entry)
    }

    /// Apply `f` to an entry and persist the result.
    pub async fn update<F>(&self, entry_id: &str, f: F) -> Result<ConfigEntry, StoreError>
    where
        F: FnOnce(&mut ConfigEntry),
    {
        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| StoreError::NotFound(entry_id.to_string()))?;
            f(entry.value_mut());
            entry.value().clone()
        };
        self.save().await?;
        Ok(updated)
    }

    pub async fn remove(&self, entry_id: &str) -> Result<Option<ConfigEntry>, StoreError> {
        let removed = self.entries.remove(entry_id).map(|(_, e)| e);
        if removed.is_some() {
            info!("Removed config entry {}", entry_id);
            self.save().await?;
        }
        Ok(removed)
    }

    async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.all(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved {} config entries", file.entries.len());
        Ok(())
    }
}
