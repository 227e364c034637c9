//! Credential records and their secret-store layout
//!
//! Two namespaces live in the secret store: the service's own records
//! (pending per-MAC credentials, global credentials, vendor defaults,
//! switch SNMP defaults) and the per-device records shared with the
//! inventory service, keyed by xname once a device has one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::secrets::SecretStore;

/// Default vendor key used when picking from the defaults map.
pub const DEFAULT_VENDOR: &str = "Cray";

// =============================================================================
// Wire / record types
// =============================================================================

/// Username/password pair issued to a BMC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Display for BmcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Username: {}, Password: <REDACTED>", self.username)
    }
}

/// One address a reporting device claims for itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    #[serde(rename = "addressType", default)]
    pub address_type: String,
    #[serde(default)]
    pub address: String,
}

/// MAC plus the IP addresses configured on that interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcAddress {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "IPAddresses", default)]
    pub ip_addresses: Vec<IpAddress>,
}

/// The address set a booting device reports in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAddresses {
    pub addresses: Vec<BmcAddress>,
}

/// Pending credential record for a BMC that has requested credentials but
/// not yet confirmed configuration completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcCredItem {
    pub addresses: SystemAddresses,
    pub credentials: BmcCredentials,
}

/// SNMPv3 default secrets for management switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCredentials {
    pub snmp_username: String,
    pub snmp_auth_password: String,
    pub snmp_priv_password: String,
}

impl fmt::Display for SwitchCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SNMPUsername: {}, SNMPAuthPassword: <REDACTED>, SNMPPrivPassword: <REDACTED>",
            self.snmp_username
        )
    }
}

/// Per-device credential record shared with the inventory service,
/// keyed by the device's xname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub xname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub snmp_auth_pass: String,
    #[serde(default)]
    pub snmp_priv_pass: String,
}

impl fmt::Display for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xname: {}, Username: {}, <REDACTED>", self.xname, self.username)
    }
}

// =============================================================================
// Credential store
// =============================================================================

/// Namespaced wrapper over the secret store for this service's records.
#[derive(Clone)]
pub struct CredentialStore {
    base: String,
    store: Arc<dyn SecretStore>,
}

impl CredentialStore {
    /// Creates a wrapper rooted at `base` (e.g. `scout-creds`).
    pub fn new(base: impl Into<String>, store: Arc<dyn SecretStore>) -> Self {
        Self {
            base: base.into(),
            store,
        }
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}/{}", self.base, suffix)
    }

    async fn lookup_as<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.store.lookup(path).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn store_as<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        self.store
            .store(path, serde_json::to_value(value)?)
            .await
            .map_err(|e| Error::SecretStore(format!("unable to store {path}: {e}")))
    }

    /// Records a pending credential item under each of the BMC's MACs.
    pub async fn add_mac_credentials(&self, mac: &str, item: &BmcCredItem) -> Result<()> {
        self.store_as(&self.path(mac), item).await
    }

    /// Fetches the pending credential item for a MAC, if one exists.
    pub async fn find_mac_credentials(&self, mac: &str) -> Result<Option<BmcCredItem>> {
        self.lookup_as(&self.path(mac)).await
    }

    /// Clears the pending credential item for a MAC.
    pub async fn clear_mac_credentials(&self, mac: &str) -> Result<()> {
        self.store.delete(&self.path(mac)).await
    }

    /// Stores the system-wide BMC credentials.
    pub async fn set_global_credentials(&self, creds: &BmcCredentials) -> Result<()> {
        self.store_as(&self.path("global/ipmi"), creds).await
    }

    /// Fetches the system-wide BMC credentials, if configured.
    pub async fn get_global_credentials(&self) -> Result<Option<BmcCredentials>> {
        self.lookup_as(&self.path("global/ipmi")).await
    }

    /// Fetches the per-vendor default credential map.
    pub async fn get_default_credentials(&self) -> Result<HashMap<String, BmcCredentials>> {
        Ok(self
            .lookup_as(&self.path("defaults"))
            .await?
            .unwrap_or_default())
    }

    /// Stores the per-vendor default credential map.
    pub async fn store_default_credentials(
        &self,
        creds: &HashMap<String, BmcCredentials>,
    ) -> Result<()> {
        self.store_as(&self.path("defaults"), creds).await
    }

    /// Fetches the default switch SNMP credentials.
    pub async fn get_default_switch_credentials(&self) -> Result<Option<SwitchCredentials>> {
        self.lookup_as(&self.path("switch_defaults")).await
    }

    /// Stores the default switch SNMP credentials.
    pub async fn store_default_switch_credentials(&self, creds: &SwitchCredentials) -> Result<()> {
        self.store_as(&self.path("switch_defaults"), creds).await
    }
}

/// Namespaced wrapper over the per-device credential records the inventory
/// service reads from.
#[derive(Clone)]
pub struct DeviceCredStore {
    base: String,
    store: Arc<dyn SecretStore>,
}

impl DeviceCredStore {
    /// Creates a wrapper rooted at `base` (e.g. `device-creds`).
    pub fn new(base: impl Into<String>, store: Arc<dyn SecretStore>) -> Self {
        Self {
            base: base.into(),
            store,
        }
    }

    fn path(&self, xname: &str) -> String {
        format!("{}/{}", self.base, xname)
    }

    /// Fetches the credential record for a device. Missing records come
    /// back as a default (empty) record, matching the fallback-chain
    /// callers that probe for emptiness.
    pub async fn get(&self, xname: &str) -> Result<DeviceCredentials> {
        let found: Option<DeviceCredentials> = match self.store.lookup(&self.path(xname)).await? {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(found.unwrap_or_default())
    }

    /// Stores the credential record for a device.
    pub async fn put(&self, creds: &DeviceCredentials) -> Result<()> {
        let value: Value = serde_json::to_value(creds)?;
        self.store.store(&self.path(&creds.xname), value).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemSecretStore;

    fn cred_store() -> CredentialStore {
        CredentialStore::new("scout-creds", Arc::new(MemSecretStore::new()))
    }

    #[tokio::test]
    async fn test_mac_credentials_roundtrip() {
        let store = cred_store();
        let item = BmcCredItem {
            addresses: SystemAddresses {
                addresses: vec![BmcAddress {
                    mac_address: "001cedc0ffee".to_string(),
                    ip_addresses: vec![],
                }],
            },
            credentials: BmcCredentials {
                username: "root".to_string(),
                password: "initial0".to_string(),
            },
        };

        store.add_mac_credentials("001cedc0ffee", &item).await.unwrap();
        assert_eq!(
            store.find_mac_credentials("001cedc0ffee").await.unwrap(),
            Some(item)
        );

        store.clear_mac_credentials("001cedc0ffee").await.unwrap();
        assert_eq!(
            store.find_mac_credentials("001cedc0ffee").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_defaults_empty_when_unset() {
        let store = cred_store();
        assert!(store.get_default_credentials().await.unwrap().is_empty());
        assert_eq!(store.get_global_credentials().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_creds_default_on_missing() {
        let store = DeviceCredStore::new("device-creds", Arc::new(MemSecretStore::new()));
        let creds = store.get("x3000c0s28b0").await.unwrap();
        assert!(creds.username.is_empty());

        let full = DeviceCredentials {
            xname: "x3000c0s28b0".to_string(),
            username: "root".to_string(),
            password: "initial0".to_string(),
            ..Default::default()
        };
        store.put(&full).await.unwrap();
        assert_eq!(store.get("x3000c0s28b0").await.unwrap(), full);
    }

    #[test]
    fn test_display_redacts_passwords() {
        let creds = BmcCredentials {
            username: "root".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!creds.to_string().contains("hunter2"));

        let sw = SwitchCredentials {
            snmp_username: "scanner".to_string(),
            snmp_auth_password: "authpw".to_string(),
            snmp_priv_password: "privpw".to_string(),
        };
        let rendered = sw.to_string();
        assert!(!rendered.contains("authpw"));
        assert!(!rendered.contains("privpw"));
    }

    #[test]
    fn test_system_addresses_wire_format() {
        let body = r#"{"addresses":[{"macAddress":"001cedc0ffee","IPAddresses":[{"addressType":"IPv4","address":"10.254.1.20"}]}]}"#;
        let parsed: SystemAddresses = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.addresses.len(), 1);
        assert_eq!(parsed.addresses[0].mac_address, "001cedc0ffee");
        assert_eq!(parsed.addresses[0].ip_addresses[0].address, "10.254.1.20");
    }
}
