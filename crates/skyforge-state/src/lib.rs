pub mod etcd;
pub mod file;
pub mod memory;
pub mod types;

use std::sync::Arc;

use anyhow::Result;

pub use etcd::EtcdStateStore;
pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use types::{load_json, store_json, StateStore};

/// Opens a store from a location string:
/// `etcd://host:port[,host:port]`, `memory://`, or a file path.
pub async fn open(location: &str) -> Result<Arc<dyn StateStore>> {
    if let Some(rest) = location.strip_prefix("etcd://") {
        let endpoints: Vec<String> = rest
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| format!("http://{s}"))
            .collect();
        if endpoints.is_empty() {
            anyhow::bail!("etcd state location '{location}' has no endpoints");
        }
        let store = EtcdStateStore::connect(&endpoints).await?;
        tracing::debug!(?endpoints, "using etcd state store");
        return Ok(Arc::new(store));
    }
    if location == "memory://" {
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    tracing::debug!(path = location, "using file state store");
    Ok(Arc::new(FileStateStore::new(location)))
}
