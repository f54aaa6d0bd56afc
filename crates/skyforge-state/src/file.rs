use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;

use crate::types::StateStore;

/// Single JSON file, rewritten atomically (temp file + rename) on every write.
///
/// Values must be JSON documents; they are stored inline so the file stays
/// readable. Writers in the same process are serialized; concurrent
/// processes should use the etcd backend instead.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    revision: u64,
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    revision: u64,
    value: Value,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Document> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Document::default()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    async fn write(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn decode(value: &[u8]) -> Result<Value> {
        serde_json::from_slice(value).context("file state store only holds JSON values")
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let value = Self::decode(&value)?;
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.revision += 1;
        let revision = doc.revision;
        doc.entries.insert(key.to_string(), Entry { revision, value });
        self.write(&doc).await?;
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let doc = self.read().await?;
        match doc.entries.get(key) {
            Some(e) => Ok(Some((serde_json::to_vec(&e.value)?, e.revision))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        if doc.entries.remove(key).is_none() {
            return Ok(doc.revision);
        }
        doc.revision += 1;
        self.write(&doc).await?;
        Ok(doc.revision)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let doc = self.read().await?;
        let mut out = Vec::new();
        for (k, e) in doc.entries.iter().filter(|(k, _)| k.starts_with(prefix)) {
            out.push((k.clone(), serde_json::to_vec(&e.value)?, e.revision));
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let value = Self::decode(&value)?;
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        let current = doc.entries.get(key).map(|e| e.revision).unwrap_or(0);
        if current != expected_revision {
            return Ok((false, current));
        }
        doc.revision += 1;
        let revision = doc.revision;
        doc.entries.insert(key.to_string(), Entry { revision, value });
        self.write(&doc).await?;
        Ok((true, revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("skyforge-state-{}-{name}", std::process::id()))
            .join("state.json")
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let path = temp_path("roundtrip");
        let store = FileStateStore::new(&path);
        let rev = store.put("/stacks/a", br#"{"x":1}"#.to_vec()).await.unwrap();

        let reopened = FileStateStore::new(&path);
        let (bytes, got_rev) = reopened.get("/stacks/a").await.unwrap().unwrap();
        assert_eq!(got_rev, rev);
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["x"], 1);

        reopened.delete("/stacks/a").await.unwrap();
        assert!(store.get("/stacks/a").await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let store = FileStateStore::new(temp_path("missing"));
        assert!(store.list_prefix("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let path = temp_path("cas");
        let store = FileStateStore::new(&path);
        let (ok, rev) = store.compare_and_swap("/k", 0, b"1".to_vec()).await.unwrap();
        assert!(ok);
        let (ok, current) = store.compare_and_swap("/k", 0, b"2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, rev);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_rejects_non_json() {
        let path = temp_path("nonjson");
        let store = FileStateStore::new(&path);
        assert!(store.put("/k", b"not json".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_key_keeps_revision() {
        let path = temp_path("delete-missing");
        let store = FileStateStore::new(&path);
        let rev = store.put("/stacks/a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.delete("/stacks/missing").await.unwrap(), rev);

        let reopened = FileStateStore::new(&path);
        assert_eq!(reopened.delete("/stacks/missing").await.unwrap(), rev);
        assert_eq!(reopened.delete("/stacks/a").await.unwrap(), rev + 1);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
