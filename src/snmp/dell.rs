//! Dell OS10-class switch driver
//!
//! Scans the learned MAC (FDB) tables over SNMP. Port numbers in the FDB
//! are mapped to interface names through two cached index maps fetched at
//! initialization; the maps go stale when a switch reboots or is
//! reconfigured, so the driver re-fetches them on failure and after a
//! bounded number of scan cycles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::oid::{last_component, mac_from_oid};
use super::session::{SessionConfig, SessionFactory, SnmpSession};
use super::{diff_tables, PortCallback, PortEventKind, SwitchDriver};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{StateStore, SwitchMacTable};
use crate::topology::TopologyClient;

/// The OID which has the model number of the switch
const OID_MODEL_NUMBER: &str = "1.3.6.1.2.1.47.1.1.1.1.13.2";

/// The OID which maps ifIndexes to human-readable names
const OID_IF_INDEX_PORT_NAME_MAP: &str = "1.3.6.1.2.1.31.1.1.1.1";

/// The OID which maps physical port numbers to ifIndexes
const OID_PORT_NUMBER_IF_INDEX: &str = "1.3.6.1.2.1.17.1.4.1.2";

/// The OID for the mac address table (with VLANs - present on all switches)
const OID_MAC_ADDRESSES_WITH_VLAN: &str = "1.3.6.1.2.1.17.7.1.2.2.1.2";

/// The OID for the NON-VLAN mac address table. Only valid if the switch is
/// configured with "enable-dot1d-mibwalk" first!
const OID_MAC_ADDRESSES_NO_VLAN: &str = "1.3.6.1.2.1.17.4.3.1.2";

/// OID for the full name and version identification of the switch's
/// operating-system and networking software.
const OID_SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";

/// Known bad switch software versions
const SW_VERSION_BLACKLIST: &[&str] = &["9.14(1.1)"];

/// Scan cycles between forced refreshes of the cached index maps
const PERIODS_TO_REFRESH: u32 = 50;

/// Searches a sysDescr string for known bad software versions.
fn verify_switch_software(sys_descr: &str, blacklist: &[&str]) -> Result<()> {
    for bad_version in blacklist {
        if sys_descr.contains(bad_version) {
            return Err(Error::BlacklistedSoftware((*bad_version).to_string()));
        }
    }
    Ok(())
}

/// Driver state for one Dell management switch.
pub struct DellOsDriver {
    name: String,
    address: String,
    model: Option<String>,

    /// Whether the cached index maps need a refetch before the next scan
    needs_init: bool,
    /// Scan cycles since the last refresh of the index maps
    period_counter: u32,

    session: Option<Box<dyn SnmpSession>>,
    sessions: SessionFactory,
    store: Option<Arc<dyn StateStore>>,
    topology: Arc<TopologyClient>,

    if_index_port_name: HashMap<i64, String>,
    port_number_if_index: HashMap<i64, i64>,

    /// Cached MAC address to port name table, diffed after each scan
    mac_map: SwitchMacTable,
}

impl DellOsDriver {
    pub fn new(topology: Arc<TopologyClient>, sessions: SessionFactory) -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            model: None,
            needs_init: true,
            period_counter: 0,
            session: None,
            sessions,
            store: None,
            topology,
            if_index_port_name: HashMap::new(),
            port_number_if_index: HashMap::new(),
            mac_map: SwitchMacTable::new(),
        }
    }

    fn session(&self) -> Result<&dyn SnmpSession> {
        self.session
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("{}: no session established", self.name)))
    }

    /// Drops the cached index maps and flags a refetch before the next
    /// scan cycle.
    fn setup_rescan(&mut self) {
        self.if_index_port_name.clear();
        self.port_number_if_index.clear();
        self.needs_init = true;
    }

    /// Fetches the ifIndex/name and port-number/ifIndex maps, first
    /// verifying the switch software against the blacklist. Blacklist
    /// hits are hard failures; map-fetch failures leave the driver marked
    /// for rescan.
    async fn fetch_switch_mappings(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        debug!("{}: Fetching mappings from the switch", self.name);

        let sys_descr = self.session()?.get(OID_SYS_DESCR).await;
        match sys_descr {
            Err(e) => {
                warn!("{}: Failed to fetch sysDescr: {e}", self.name);
                first_error = Some(e);
            }
            Ok(sys_descr) => {
                verify_switch_software(&sys_descr, SW_VERSION_BLACKLIST).map_err(|e| {
                    warn!(
                        "{}: Found known bad switch software version in sysDescr: {sys_descr}",
                        self.name
                    );
                    e
                })?;
                info!(
                    "Verified that switch software version is not on the blacklist for {}",
                    self.name
                );
            }
        }

        let name_binds = self.session()?.get_bulk_walk(OID_IF_INDEX_PORT_NAME_MAP).await;
        match name_binds {
            Err(e) => {
                warn!("Failed to get interface->name map for {}: {e}", self.name);
                first_error.get_or_insert(e);
            }
            Ok(binds) => {
                let mut map = HashMap::new();
                for bind in binds {
                    let Some(raw) = last_component(&bind.oid) else {
                        continue;
                    };
                    match raw.parse::<i64>() {
                        Ok(if_index) => {
                            map.insert(if_index, bind.value);
                        }
                        Err(e) => {
                            first_error.get_or_insert(Error::SnmpTransport(format!(
                                "failed to convert ifIndex {raw} to integer: {e}"
                            )));
                        }
                    }
                }
                self.if_index_port_name = map;
            }
        }

        let number_binds = self.session()?.get_bulk_walk(OID_PORT_NUMBER_IF_INDEX).await;
        match number_binds {
            Err(e) => {
                warn!(
                    "Failed to get interface->portNumber map for {}: {e}",
                    self.name
                );
                first_error.get_or_insert(e);
            }
            Ok(binds) => {
                let mut map = HashMap::new();
                for bind in binds {
                    let Some(raw_port) = last_component(&bind.oid) else {
                        continue;
                    };
                    match (raw_port.parse::<i64>(), bind.value.parse::<i64>()) {
                        (Ok(port_number), Ok(if_index)) => {
                            map.insert(port_number, if_index);
                        }
                        _ => {
                            first_error.get_or_insert(Error::SnmpTransport(format!(
                                "failed to convert port entry {raw_port}={} to integers",
                                bind.value
                            )));
                        }
                    }
                }
                self.port_number_if_index = map;
            }
        }

        debug!("{}: Done fetching mappings", self.name);

        match first_error {
            None => {
                self.needs_init = false;
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Fetches the MAC-to-port-number map from one FDB table.
    async fn fetch_dynamic_macs(&self, use_vlans: bool) -> Result<HashMap<String, i64>> {
        let table_oid = if use_vlans {
            OID_MAC_ADDRESSES_WITH_VLAN
        } else {
            OID_MAC_ADDRESSES_NO_VLAN
        };

        let binds = self.session()?.get_bulk_walk(table_oid).await.map_err(|e| {
            warn!("{}: Failed to get MAC address table ports: {e}", self.name);
            e
        })?;

        let mut mac_port_map = HashMap::new();
        for bind in binds {
            let mac = match mac_from_oid(&bind.oid) {
                Ok(mac) => mac,
                Err(e) => {
                    warn!(
                        "{}: Failed to parse OID {} into a MAC address: {e}",
                        self.name, bind.oid
                    );
                    continue;
                }
            };

            let port_number = match bind.value.parse::<i64>() {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        "{}: Failed to turn port number {} into an integer: {e}",
                        self.name, bind.value
                    );
                    continue;
                }
            };

            // Port zero means the entry is not a learned address.
            if port_number != 0 {
                mac_port_map.insert(mac, port_number);
            }
        }

        Ok(mac_port_map)
    }

    /// Builds the MAC address to port name table from both FDB variants,
    /// mapping port numbers through the cached index maps.
    async fn fetch_mac_port_name_table(&mut self) -> Result<SwitchMacTable> {
        let mut port_map = self.fetch_dynamic_macs(false).await?;
        let vlan_map = self.fetch_dynamic_macs(true).await?;

        for (mac, port) in vlan_map {
            port_map.entry(mac).or_insert(port);
        }

        let mut ret = SwitchMacTable::new();
        let mut stale_maps = false;
        for (mac, port_number) in port_map {
            let Some(&if_index) = self.port_number_if_index.get(&port_number) else {
                warn!("{}: Failed to map port {port_number} to ifIndex", self.name);
                stale_maps = true;
                continue;
            };
            let Some(name) = self.if_index_port_name.get(&if_index) else {
                warn!("{}: Failed to map ifIndex {if_index} to port name", self.name);
                stale_maps = true;
                continue;
            };
            ret.insert(mac, name.clone());
        }

        // An unmappable port usually means the switch's index layout
        // changed under us.
        if stale_maps {
            self.setup_rescan();
        }
        Ok(ret)
    }
}

#[async_trait]
impl SwitchDriver for DellOsDriver {
    async fn init(&mut self, name: &str, store: Arc<dyn StateStore>) -> Result<()> {
        let stored_info = self.topology.get_switch_by_name(name).await.map_err(|e| {
            warn!("Couldn't fetch information on switch {name} from topology, not monitoring switch");
            e
        })?;

        self.name = name.to_string();
        self.address = stored_info.address.clone();
        self.store = Some(store);
        if !stored_info.model.is_empty() {
            self.model = Some(stored_info.model.clone());
        }

        let config = SessionConfig::from_switch(&stored_info);
        self.session = Some((self.sessions)(config));
        debug!("{}: session established to {}", self.name, self.address);

        if let Some(model) = &self.model {
            info!("{}: Switch hinted as model {model}", self.name);
        } else {
            debug!("{}: Fetching switch model", self.name);
            let fetched = self.session()?.get(OID_MODEL_NUMBER).await;
            match fetched {
                Ok(model) => self.model = Some(model),
                Err(e) => warn!("{}: Failed to fetch model: {e}", self.name),
            }
        }
        debug!("{}: Switch is model {:?}", self.name, self.model);

        let mapped = self.fetch_switch_mappings().await;
        match mapped {
            Ok(()) => {}
            // Blacklisted software is a hard failure; anything else gets
            // retried during the scan loop.
            Err(e @ Error::BlacklistedSoftware(_)) => return Err(e),
            Err(_) => self.setup_rescan(),
        }

        // Seed the diff base from the last persisted table so a restart
        // does not replay every known MAC as an addition.
        match self.store.as_ref() {
            Some(store) => match store.get_switch_state(&self.name).await {
                Ok(Some(saved)) => self.mac_map = saved,
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not retrieve saved state for switch {}: {e}", self.name);
                }
            },
            None => {}
        }

        Ok(())
    }

    async fn periodic_scan(&mut self, cb: &PortCallback) {
        if self.needs_init || self.period_counter > PERIODS_TO_REFRESH {
            debug!("{}: Need to refetch mapping information", self.name);
            let refreshed = self.fetch_switch_mappings().await;
            match refreshed {
                Ok(()) => {
                    self.period_counter = 0;
                }
                Err(_) => {
                    warn!(
                        "{}: Failed to rescan switch; not proceeding with updates",
                        self.name
                    );
                    metrics::SCAN_ERRORS.inc();
                    return;
                }
            }
        }
        self.period_counter += 1;

        let fetched = self.fetch_mac_port_name_table().await;
        let mac_table = match fetched {
            Ok(table) => table,
            Err(e) => {
                // The switch is likely offline or mid-reboot. Pretend the
                // table is unchanged and rescan once it talks again.
                warn!("Error fetching MAC address table (pretending the table has not changed): {e}");
                self.setup_rescan();
                metrics::SCAN_ERRORS.inc();
                return;
            }
        };

        let (added, removed) = diff_tables(&self.mac_map, &mac_table);

        self.mac_map = mac_table;
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.set_switch_state(&self.name, &self.mac_map).await {
                warn!("Unable to store mac address map: {e}");
            }
        }

        for (mac, port) in &added {
            cb(PortEventKind::Add, &self.name, mac, port);
        }
        for (mac, port) in &removed {
            cb(PortEventKind::Remove, &self.name, mac, port);
        }

        metrics::SWITCH_SCANS.inc();
    }

    async fn handle_message(&mut self, _cb: &PortCallback, message: &HashMap<String, String>) {
        // Informs arrive well before the learned table settles, so the
        // periodic scan is the reliable path; nothing to extract here.
        debug!(
            "{}: ignoring inform with {} attributes",
            self.name,
            message.len()
        );
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Tests
// =============================================================================
