use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Revisioned key/value store holding recorded deploy state.
///
/// Every write returns the store-wide revision it was committed at; a key's
/// revision is the revision of its last write (0 = absent).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Writes `value` only if the key's revision is still `expected_revision`.
    /// Returns whether the write happened and the key's current revision.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    let Some((bytes, rev)) = store.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("corrupt state at {key}"))?;
    Ok(Some((value, rev)))
}

/// Compare-and-swap write of a JSON document.
pub async fn store_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    expected_revision: u64,
    value: &T,
) -> Result<u64> {
    let bytes = serde_json::to_vec(value)?;
    let (ok, rev) = store.compare_and_swap(key, expected_revision, bytes).await?;
    if !ok {
        anyhow::bail!(
            "state at {key} changed concurrently (expected revision {expected_revision}, found {rev})"
        );
    }
    Ok(rev)
}
