//! Switch scanning
//!
//! Each vendor implements [`SwitchDriver`]; all variants feed the same
//! add/remove callback so the rest of the service never sees vendor
//! details. The wire transport lives behind [`session::SnmpSession`].

pub mod dell;
pub mod inform;
pub mod oid;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::{StateStore, SwitchMacTable};

/// A change in the physical layout we care about: a MAC appearing on or
/// disappearing from a switch port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortEventKind {
    Add,
    Remove,
}

impl std::fmt::Display for PortEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortEventKind::Add => write!(f, "add"),
            PortEventKind::Remove => write!(f, "remove"),
        }
    }
}

/// Callback fired per detected change: (kind, switch name, mac, port name).
pub type PortCallback = Arc<dyn Fn(PortEventKind, &str, &str, &str) + Send + Sync>;

/// One vendor's way of scanning a switch for learned MAC addresses.
#[async_trait]
pub trait SwitchDriver: Send + Sync {
    /// Core setup: resolve switch metadata from topology, establish a
    /// protocol session, verify the switch software against the
    /// blacklist, and seed the cached MAC table from persisted state.
    async fn init(&mut self, name: &str, store: Arc<dyn StateStore>) -> Result<()>;

    /// Perform a single periodic scan, firing the callback for each
    /// changed MAC/port pairing.
    async fn periodic_scan(&mut self, cb: &PortCallback);

    /// Handle a pushed event (SNMP inform) from this switch. The message
    /// is a map from numeric OID to string value. Not all vendors extract
    /// anything useful here.
    async fn handle_message(&mut self, cb: &PortCallback, message: &HashMap<String, String>);

    /// Human-usable name, mostly for log messages.
    fn name(&self) -> &str;
}

/// Diffs two MAC/port tables.
///
/// Returns pairs new in `new_table` and pairs that disappeared from
/// `old_table`. A key present in both with a different value (a port
/// move) shows up in both sets.
pub fn diff_tables(
    old_table: &SwitchMacTable,
    new_table: &SwitchMacTable,
) -> (SwitchMacTable, SwitchMacTable) {
    let mut added = SwitchMacTable::new();
    let mut removed = SwitchMacTable::new();

    for (key, new_val) in new_table {
        if old_table.get(key) != Some(new_val) {
            added.insert(key.clone(), new_val.clone());
        }
    }
    for (key, old_val) in old_table {
        if new_table.get(key) != Some(old_val) {
            removed.insert(key.clone(), old_val.clone());
        }
    }

    (added, removed)
}

// =============================================================================
// Tests
// =============================================================================
