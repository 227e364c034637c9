//! Persistent discovery state
//!
//! The state store is the single point of truth for per-device discovery
//! records and per-switch MAC tables. Per-key operations are atomic; callers
//! never hold locks around the store. Backing engines implement [`StateStore`].

mod mem;
mod sqlite;

pub use mem::MemStore;
pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Device State
// =============================================================================

/// Merged discovery state for one device, keyed by its hardware MAC address.
///
/// The MAC is the only stable identifier before a device resolves to an
/// xname. The agent channel fills the credential and IP fields; the network
/// channel fills the switch linkage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Whether the in-band agent has reported this MAC
    pub discovered_agent: bool,
    /// Whether switch-level MAC learning has reported this MAC
    pub discovered_network: bool,
    /// The switch this MAC is connected to. Set by the network channel
    pub switch_name: String,
    /// The port this MAC is connected to. Set by the network channel
    pub switch_port: String,
    /// The BMC username issued to the device. Set by the agent channel
    pub username: String,
    /// The BMC password issued to the device. Set by the agent channel
    pub password: String,
    /// The IP address the device reported for itself. Set by the agent channel
    pub ip_address: String,
}

impl DeviceState {
    /// A device is ready for promotion iff both channels have seen it.
    pub fn ready_for_promotion(&self) -> bool {
        self.discovered_agent && self.discovered_network
    }

    /// Drop the agent-sourced fields after promotion, keeping the switch
    /// linkage so a later agent re-report can re-trigger promotion without
    /// a fresh network observation.
    pub fn clear_agent_fields(&mut self) {
        self.discovered_agent = false;
        self.username.clear();
        self.password.clear();
        self.ip_address.clear();
    }
}

// Suppress credentials in log output.
impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceState - agent:{}, network:{}. Switch:{}[{}] IP:{}",
            self.discovered_agent,
            self.discovered_network,
            self.switch_name,
            self.switch_port,
            self.ip_address
        )
    }
}

// =============================================================================
// Store Contract
// =============================================================================

/// A MAC address to port name table as learned from one switch.
pub type SwitchMacTable = HashMap<String, String>;

/// The contract every state store engine satisfies.
///
/// Implementations are internally synchronized and safe to share across
/// tasks. "Not found" is not an error: lookups return `Ok(None)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Retrieves the saved MAC table for a switch, or `None` if the switch
    /// has never been scanned.
    async fn get_switch_state(&self, name: &str) -> Result<Option<SwitchMacTable>>;

    /// Saves the MAC table for a switch, replacing any previous table.
    async fn set_switch_state(&self, name: &str, state: &SwitchMacTable) -> Result<()>;

    /// Retrieves the merged discovery state for a MAC address.
    async fn get_mac_state(&self, mac: &str) -> Result<Option<DeviceState>>;

    /// Saves the merged discovery state for a MAC address.
    async fn set_mac_state(&self, mac: &str, state: &DeviceState) -> Result<()>;

    /// Clears all stored state for a MAC address.
    async fn clear_mac_state(&self, mac: &str) -> Result<()>;

    /// Probes the connection to the backing engine.
    async fn check_liveness(&self) -> bool;
}

// =============================================================================
// Key layout and factory
// =============================================================================

const KEY_PREFIX_SWITCH_STATE: &str = "switch-state/";
const KEY_PREFIX_MAC_STATE: &str = "mac-state/";
const KEY_LIVENESS: &str = "liveness";

fn switch_key(name: &str) -> String {
    format!("{KEY_PREFIX_SWITCH_STATE}{name}")
}

fn mac_key(mac: &str) -> String {
    format!("{KEY_PREFIX_MAC_STATE}{mac}")
}

/// Creates a state store from a datastore URL.
///
/// `mem:` selects the in-memory engine (tests and local runs); anything
/// else is treated as a filesystem path for the durable engine.
pub fn make_store(url: &str) -> Result<Arc<dyn StateStore>> {
    if url == "mem:" {
        return Ok(Arc::new(MemStore::new()));
    }
    if let Some(path) = url.strip_prefix("sqlite:") {
        return Ok(Arc::new(SqliteStore::open(path)?));
    }
    Err(Error::Config(format!(
        "datastore URL must be \"mem:\" or \"sqlite:<path>\", got {url}"
    )))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_requires_both_channels() {
        let mut state = DeviceState::default();
        assert!(!state.ready_for_promotion());

        state.discovered_network = true;
        assert!(!state.ready_for_promotion());

        state.discovered_agent = true;
        assert!(state.ready_for_promotion());

        state.discovered_network = false;
        assert!(!state.ready_for_promotion());
    }

    #[test]
    fn test_clear_agent_fields_keeps_switch_linkage() {
        let mut state = DeviceState {
            discovered_agent: true,
            discovered_network: true,
            switch_name: "x3000c0w14".to_string(),
            switch_port: "ethernet1/1/20".to_string(),
            username: "root".to_string(),
            password: "hunter2".to_string(),
            ip_address: "10.254.1.20".to_string(),
        };

        state.clear_agent_fields();

        assert!(!state.discovered_agent);
        assert!(state.discovered_network);
        assert_eq!(state.switch_name, "x3000c0w14");
        assert_eq!(state.switch_port, "ethernet1/1/20");
        assert!(state.username.is_empty());
        assert!(state.password.is_empty());
        assert!(state.ip_address.is_empty());
    }

    #[test]
    fn test_display_redacts_credentials() {
        let state = DeviceState {
            username: "root".to_string(),
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = state.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("root"));
    }

    #[test]
    fn test_make_store_rejects_unknown_scheme() {
        assert!(make_store("etcd://somewhere:2379").is_err());
        assert!(make_store("mem:").is_ok());
    }
}
