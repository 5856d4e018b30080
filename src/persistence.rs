use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

use crate::errors::{NotifyError, Result};

/// Key/value JSON store backing the subscription cache.
pub trait SubscriptionStore: Send + Sync {
    /// All entries whose key starts with `prefix`, ordered by key.
    fn get_all(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store with an optional JSON snapshot file.
///
/// Mutations only touch memory; `save_snapshot` (or `autosave_loop`) writes the
/// file when something changed since the last save.
pub struct JsonStore {
    entries: RwLock<BTreeMap<String, Value>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open a store backed by `path`, loading the snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load_snapshot(&path)?;
        tracing::info!("Loaded snapshot: {} entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write the current entries to the snapshot file.
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let json = {
            let entries = self.entries.read();
            let obj: Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            serde_json::to_string_pretty(&Value::Object(obj))?
        };

        if let Err(e) = tokio::fs::write(path, json).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        tracing::info!("Snapshot saved");
        Ok(())
    }
}

impl SubscriptionStore for JsonStore {
    fn get_all(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.entries.write().remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<String, Value>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No snapshot found at startup (path = {})", path.display());
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<Value>(&data)? {
        Value::Object(obj) => Ok(obj.into_iter().collect()),
        _ => Err(NotifyError::Store(format!(
            "snapshot {} is not a JSON object",
            path.display()
        ))),
    }
}

/// Background task that periodically saves the snapshot.
pub async fn autosave_loop(store: Arc<JsonStore>, every_sec: u64) {
    loop {
        sleep(Duration::from_secs(every_sec)).await;
        if let Err(e) = store.save_snapshot().await {
            tracing::warn!("Failed to write snapshot file: {e}");
        }
    }
}
