//! In-memory state store, used by tests and `mem:` datastore URLs.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{mac_key, switch_key, DeviceState, StateStore, SwitchMacTable};
use crate::error::Result;

/// A state store held entirely in process memory.
#[derive(Default)]
pub struct MemStore {
    entries: DashMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemStore {
    async fn get_switch_state(&self, name: &str) -> Result<Option<SwitchMacTable>> {
        match self.entries.get(&switch_key(name)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    async fn set_switch_state(&self, name: &str, state: &SwitchMacTable) -> Result<()> {
        self.entries
            .insert(switch_key(name), serde_json::to_string(state)?);
        Ok(())
    }

    async fn get_mac_state(&self, mac: &str) -> Result<Option<DeviceState>> {
        match self.entries.get(&mac_key(mac)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    async fn set_mac_state(&self, mac: &str, state: &DeviceState) -> Result<()> {
        self.entries
            .insert(mac_key(mac), serde_json::to_string(state)?);
        Ok(())
    }

    async fn clear_mac_state(&self, mac: &str) -> Result<()> {
        self.entries.remove(&mac_key(mac));
        Ok(())
    }

    async fn check_liveness(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mac_state_roundtrip() {
        let store = MemStore::new();
        let state = DeviceState {
            discovered_network: true,
            switch_name: "x3000c0w14".to_string(),
            switch_port: "ethernet1/1/3".to_string(),
            ..Default::default()
        };

        store.set_mac_state("a4bf002b6eff", &state).await.unwrap();
        let loaded = store.get_mac_state("a4bf002b6eff").await.unwrap();
        assert_eq!(loaded, Some(state));

        store.clear_mac_state("a4bf002b6eff").await.unwrap();
        assert_eq!(store.get_mac_state("a4bf002b6eff").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_switch_state_roundtrip() {
        let store = MemStore::new();
        let mut table = SwitchMacTable::new();
        table.insert("a4bf002b6eff".to_string(), "ethernet1/1/3".to_string());

        store.set_switch_state("x3000c0w14", &table).await.unwrap();
        assert_eq!(
            store.get_switch_state("x3000c0w14").await.unwrap(),
            Some(table)
        );
        assert_eq!(store.get_switch_state("x3000c0w15").await.unwrap(), None);
    }
}
