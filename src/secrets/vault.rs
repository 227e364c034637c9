//! Vault KV adapter for the secret store trait.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::SecretStore;
use crate::error::{Error, Result};

/// Secret store backed by the Vault KV (version 1) HTTP API.
pub struct VaultSecretStore {
    client: Client,
    base_url: String,
    token: String,
}

impl VaultSecretStore {
    /// Builds an adapter for the Vault server at `addr` (e.g.
    /// `http://vault:8200`) using `mount` as the KV mount point.
    pub fn new(addr: &str, mount: &str, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}/v1/{}", addr.trim_end_matches('/'), mount),
            token,
        })
    }

    /// Reads the Vault address and token from the conventional environment
    /// variables (`VAULT_ADDR`, `VAULT_TOKEN`).
    pub fn from_env(mount: &str) -> Result<Self> {
        let addr = std::env::var("VAULT_ADDR")
            .map_err(|_| Error::Config("VAULT_ADDR is not set".to_string()))?;
        let token = std::env::var("VAULT_TOKEN")
            .map_err(|_| Error::Config("VAULT_TOKEN is not set".to_string()))?;
        Self::new(&addr, mount, token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn store(&self, path: &str, value: Value) -> Result<()> {
        let resp = self
            .client
            .post(self.url(path))
            .header("X-Vault-Token", &self.token)
            .json(&value)
            .send()
            .await
            .map_err(|e| Error::SecretStore(format!("store {path}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::SecretStore(format!(
                "store {path}: vault returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn lookup(&self, path: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| Error::SecretStore(format!("lookup {path}: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("No secret at {path}");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::SecretStore(format!(
                "lookup {path}: vault returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::SecretStore(format!("lookup {path}: bad body: {e}")))?;

        // KV v1 wraps the stored value in a "data" envelope.
        Ok(body.get("data").cloned())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| Error::SecretStore(format!("delete {path}: {e}")))?;

        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Error::SecretStore(format!(
                "delete {path}: vault returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_cleanly() {
        let store =
            VaultSecretStore::new("http://vault:8200/", "secret", "tok".to_string()).unwrap();
        assert_eq!(
            store.url("/scout-creds/global/ipmi"),
            "http://vault:8200/v1/secret/scout-creds/global/ipmi"
        );
    }
}
