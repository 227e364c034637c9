//! Secret storage abstraction
//!
//! Credentials never touch the state store; they live behind this trait.
//! The production adapter speaks the Vault KV HTTP API; tests use the
//! in-memory store.

mod vault;

pub use vault::VaultSecretStore;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;

/// Namespaced secret storage keyed by path.
///
/// "Not found" is not an error: lookups return `Ok(None)`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Stores a JSON value at a path, replacing any previous value.
    async fn store(&self, path: &str, value: Value) -> Result<()>;

    /// Retrieves the JSON value at a path.
    async fn lookup(&self, path: &str) -> Result<Option<Value>>;

    /// Deletes the value at a path. Deleting a missing path succeeds.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// In-memory secret store for tests and local runs.
#[derive(Default)]
pub struct MemSecretStore {
    entries: DashMap<String, Value>,
}

impl MemSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemSecretStore {
    async fn store(&self, path: &str, value: Value) -> Result<()> {
        self.entries.insert(path.to_string(), value);
        Ok(())
    }

    async fn lookup(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(path).map(|v| v.value().clone()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.entries.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mem_store_roundtrip() {
        let store = MemSecretStore::new();

        store
            .store("creds/global", json!({"username": "root"}))
            .await
            .unwrap();
        let found = store.lookup("creds/global").await.unwrap();
        assert_eq!(found, Some(json!({"username": "root"})));

        store.delete("creds/global").await.unwrap();
        assert_eq!(store.lookup("creds/global").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_path_is_none() {
        let store = MemSecretStore::new();
        assert_eq!(store.lookup("creds/nope").await.unwrap(), None);
        // Deleting a missing path is not an error
        store.delete("creds/nope").await.unwrap();
    }
}
