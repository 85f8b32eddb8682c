//! Persisted-document boundary (spec §1): devices/characters/personas/
//! settings are external JSON documents the engine only reads (and, for
//! `toggle_reminder`/`toggle_button`, writes back). Out of scope beyond
//! this contract — no schema migration, no caching layer, no watch/reload.
//!
//! Grounded on the teacher's `envelope/export.rs`/`import.rs` — a
//! stubbed `to_json`/`from_json` contract the teacher itself left
//! unfinished ("not yet implemented (checkpoint 2)"), read as a signal
//! that persistence here should stay a thin, swappable boundary rather
//! than a fleshed-out store.

use crate::devices::DeviceRecord;
use crate::types::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Minimal JSON-document store over a directory of `*.json` files. Async
/// because the teacher's persistence boundary elsewhere in the pack is
/// consistently `tokio::fs`-backed (non-blocking I/O inside the single
/// executor), not because these documents are large.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn load_devices(&self) -> Result<Vec<DeviceRecord>>;
    async fn load_document(&self, name: &str) -> Result<Value>;
    async fn save_document(&self, name: &str, value: &Value) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait::async_trait]
impl Store for JsonFileStore {
    async fn load_devices(&self) -> Result<Vec<DeviceRecord>> {
        let path = self.path_for("devices");
        if !Path::new(&path).exists() {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::config(format!("devices.json: {e}")))
    }

    async fn load_document(&self, name: &str) -> Result<Value> {
        let path = self.path_for(name);
        if !Path::new(&path).exists() {
            return Ok(Value::Null);
        }
        let bytes = tokio::fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    async fn save_document(&self, name: &str, value: &Value) -> Result<()> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_devices_file_yields_empty_catalog() {
        let store = JsonFileStore::new("/nonexistent/path/for/test");
        let devices = store.load_devices().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn round_trips_a_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let doc = serde_json::json!({"a": 1});
        store.save_document("settings", &doc).await.unwrap();
        let loaded = store.load_document("settings").await.unwrap();
        assert_eq!(loaded, doc);
    }
}
