use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::StateStore;

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every entry of `source` into a fresh memory store.
    pub async fn snapshot_of(source: &dyn StateStore) -> Result<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for (key, value, _) in source.list_prefix("/").await? {
                let rev = inner.next_revision();
                inner.kv.insert(key, (value, rev));
            }
        }
        Ok(store)
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = inner.next_revision();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.kv.remove(key);
        Ok(inner.next_revision())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;
        let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current_rev != expected_revision {
            return Ok((false, current_rev));
        }
        let rev = inner.next_revision();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok((true, rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStateStore::new();
        let rev = store.put("/stacks/a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.get("/stacks/a").await.unwrap(), Some((b"1".to_vec(), rev)));
        store.delete("/stacks/a").await.unwrap();
        assert_eq!(store.get("/stacks/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = MemoryStateStore::new();
        store.put("/stacks/x/a", b"1".to_vec()).await.unwrap();
        store.put("/stacks/x/b", b"2".to_vec()).await.unwrap();
        store.put("/stacks/y/a", b"3".to_vec()).await.unwrap();
        let keys: Vec<String> = store
            .list_prefix("/stacks/x/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/stacks/x/a", "/stacks/x/b"]);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStateStore::new();
        let (ok, rev) = store.compare_and_swap("/k", 0, b"a".to_vec()).await.unwrap();
        assert!(ok);
        let (ok, current) = store.compare_and_swap("/k", 0, b"b".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, rev);
        let (ok, _) = store.compare_and_swap("/k", rev, b"c".to_vec()).await.unwrap();
        assert!(ok);
        assert_eq!(store.get("/k").await.unwrap().unwrap().0, b"c".to_vec());
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let source = MemoryStateStore::new();
        source.put("/stacks/a", b"1".to_vec()).await.unwrap();
        let copy = MemoryStateStore::snapshot_of(&source).await.unwrap();
        copy.put("/stacks/b", b"2".to_vec()).await.unwrap();
        assert!(copy.get("/stacks/a").await.unwrap().is_some());
        assert!(source.get("/stacks/b").await.unwrap().is_none());
    }
}
