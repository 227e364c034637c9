//! Fabric switch discovery
//!
//! Fabric switch BMCs carry their own Redfish endpoint and no switch-port
//! path to be discovered through, so they are watched directly: the
//! layout service supplies the list, and one task per BMC probes its
//! Redfish root, registering the endpoint when it surfaces and disabling
//! it when it goes away. Newly surfaced BMCs also get their syslog/NTP/
//! SSH configuration pushed over Redfish.

pub mod nwprotocol;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::credentials::{CredentialStore, DeviceCredStore, DEFAULT_VENDOR};
use crate::error::{Error, Result};
use crate::health::Health;
use crate::inventory::{EndpointRegistration, InventoryClient};
use crate::topology::{HardwareRecord, TopologyClient, VAULT_URL_PREFIX};

use nwprotocol::NetworkProtocolSettings;

/// How often each BMC is probed for liveness
const PROBE_PERIOD: Duration = Duration::from_secs(30);

/// Delay between successful list polls
const LIST_POLL_PERIOD: Duration = Duration::from_secs(30);

/// Backoff growth per failed list poll, and its ceiling
const LIST_POLL_BACKOFF_STEP: Duration = Duration::from_secs(5);
const LIST_POLL_BACKOFF_MAX: Duration = Duration::from_secs(300);

// =============================================================================
// Records
// =============================================================================

/// One fabric switch BMC from the layout service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterBmc {
    pub xname: String,
    /// Candidate addresses, most preferred first
    pub addresses: Vec<String>,
    /// Credential hints from the layout record; `vault://` references are
    /// resolved through the credential chain instead
    pub username: String,
    pub password: String,
}

impl RouterBmc {
    /// Extracts the watchable addresses and credential hints from a
    /// layout record. DHCP placeholder addresses are not probeable and
    /// are dropped.
    pub fn from_record(record: &HardwareRecord) -> Self {
        let mut addresses = Vec::new();
        let ip6 = record.extra_str("IP6addr").unwrap_or_default();
        if !ip6.is_empty() && !ip6.eq_ignore_ascii_case("dhcpv6") {
            addresses.push(ip6.to_string());
        }
        let ip4 = record.extra_str("IP4addr").unwrap_or_default();
        if !ip4.is_empty() && !ip4.eq_ignore_ascii_case("dhcpv4") {
            addresses.push(ip4.to_string());
        }

        Self {
            xname: record.xname.clone(),
            addresses,
            username: record.extra_str("Username").unwrap_or_default().to_string(),
            password: record.extra_str("Password").unwrap_or_default().to_string(),
        }
    }
}

/// Whether a list-poll failure is worth retrying (the layout service is
/// unreachable or not ready) or fatal to the subsystem (bad payload).
fn is_transient(e: &Error) -> bool {
    match e {
        Error::UpstreamStatus { .. } => true,
        Error::Http(e) => !e.is_decode(),
        _ => false,
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Watches the fabric switch inventory and one Redfish endpoint per BMC.
pub struct FabricDiscovery {
    topology: Arc<TopologyClient>,
    inventory: Arc<InventoryClient>,
    device_creds: DeviceCredStore,
    cred_store: CredentialStore,
    health: Arc<Health>,
    settings: Option<NetworkProtocolSettings>,
    probe: Client,
    watchers: DashMap<String, CancellationToken>,
}

impl FabricDiscovery {
    pub fn new(
        topology: Arc<TopologyClient>,
        inventory: Arc<InventoryClient>,
        device_creds: DeviceCredStore,
        cred_store: CredentialStore,
        health: Arc<Health>,
        settings: Option<NetworkProtocolSettings>,
    ) -> Result<Arc<Self>> {
        // BMCs ship self-signed certificates; probing must tolerate them.
        let probe = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            topology,
            inventory,
            device_creds,
            cred_store,
            health,
            settings,
            probe,
            watchers: DashMap::new(),
        }))
    }

    /// Polls the fabric switch list forever, reconciling the per-BMC
    /// watch tasks on each successful read. Unreachable-layout errors are
    /// retried with growing backoff; a malformed payload ends the
    /// subsystem (the rest of the service keeps running).
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut backoff = Duration::ZERO;

        loop {
            let wait = match self.topology.get_router_bmcs().await {
                Ok(records) => {
                    // Mark the list as read as soon as possible so the
                    // readiness probe doesn't restart the pod just as
                    // this succeeds.
                    self.health.set_fabric_list_read();
                    backoff = Duration::ZERO;
                    self.clone().reconcile_watchers(&records);
                    LIST_POLL_PERIOD
                }
                Err(e) if is_transient(&e) => {
                    error!("While attempting to get fabric switches, retrying: {e}");
                    backoff = (backoff + LIST_POLL_BACKOFF_STEP).min(LIST_POLL_BACKOFF_MAX);
                    backoff
                }
                Err(e) => {
                    error!("Problem retrieving list of fabric switches: {e}");
                    break;
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Fabric discovery shutting down, stopping all watch tasks");
        for entry in self.watchers.iter() {
            entry.value().cancel();
        }
        self.watchers.clear();
    }

    /// Diffs the reported BMC set against the running watch tasks.
    fn reconcile_watchers(self: Arc<Self>, records: &[HardwareRecord]) {
        let current: HashSet<&str> = records.iter().map(|r| r.xname.as_str()).collect();

        let gone: Vec<String> = self
            .watchers
            .iter()
            .filter(|entry| !current.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for xname in gone {
            if let Some((_, token)) = self.watchers.remove(&xname) {
                info!("{xname} is no longer in the layout service; terminating watch task");
                token.cancel();
            }
        }

        for record in records {
            if self.watchers.contains_key(&record.xname) {
                continue;
            }
            info!("Fabric switch {} is new; starting watch task", record.xname);
            let token = CancellationToken::new();
            self.watchers.insert(record.xname.clone(), token.clone());
            let bmc = RouterBmc::from_record(record);
            tokio::spawn(self.clone().watch_router_bmc(bmc, token));
        }
    }

    /// Returns the first address whose Redfish root answers.
    async fn check_up(&self, addresses: &[String]) -> Option<String> {
        for address in addresses {
            debug!("GET from https://{address}/redfish/v1/");
            match self.probe.get(format!("https://{address}/redfish/v1/")).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    trace!("{address} is present");
                    return Some(address.clone());
                }
                Ok(resp) => {
                    trace!("Unable to reach out to {address} ({})", resp.status());
                }
                Err(e) => {
                    trace!("Error reaching out to {address}: {e}");
                }
            }
        }
        None
    }

    /// Watches one BMC for presence transitions until cancelled.
    async fn watch_router_bmc(self: Arc<Self>, bmc: RouterBmc, token: CancellationToken) {
        if bmc.addresses.is_empty() {
            warn!("No known address for {}; not monitoring it", bmc.xname);
            return;
        }

        let mut present = match self.inventory.endpoint_present(&bmc.xname).await {
            Ok(present) => {
                info!("{} in inventory: {present}", bmc.xname);
                present
            }
            Err(e) => {
                warn!(
                    "Unable to get state for {}; assuming current network state: {e}",
                    bmc.xname
                );
                self.check_up(&bmc.addresses).await.is_some()
            }
        };

        let mut ticker = tokio::time::interval(PROBE_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Watch task for {} received stop signal; terminating", bmc.xname);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match (self.check_up(&bmc.addresses).await, present) {
                (Some(address), false) => {
                    // BMC has appeared
                    self.notify_present(&bmc, &address).await;
                    present = true;
                }
                (None, true) => {
                    // BMC disappeared
                    self.inventory.notify_removed(&bmc.xname).await;
                    present = false;
                }
                _ => trace!("{} has not changed state", bmc.xname),
            }
        }
    }

    /// A BMC surfaced: make sure its credentials exist in the secret
    /// store, register the endpoint, and push the network-protocol
    /// configuration. Each leg is best-effort; the presence transition
    /// stands either way.
    async fn notify_present(&self, bmc: &RouterBmc, address: &str) {
        self.ensure_credentials(bmc).await;

        // Blank credential fields signal the inventory service to pull
        // from the secret store.
        let payload = EndpointRegistration {
            id: bmc.xname.clone(),
            fqdn: bmc.xname.clone(),
            ip_address: address.to_string(),
            rediscover_on_update: true,
            ..Default::default()
        };
        if let Err(e) = self.inventory.register_endpoint(&payload).await {
            warn!("Unable to register fabric BMC {}: {e}", bmc.xname);
        }

        if let Some(settings) = &self.settings {
            let globals = match self.cred_store.get_global_credentials().await {
                Ok(Some(creds)) => creds,
                Ok(None) => Default::default(),
                Err(e) => {
                    warn!("Unable to get global credentials for {}: {e}", bmc.xname);
                    Default::default()
                }
            };
            if let Err(e) = settings
                .apply(&self.probe, address, &globals.username, &globals.password)
                .await
            {
                warn!("Error setting network protocol data for {}: {e}", bmc.xname);
            }
        }
    }

    /// Seeds the per-device credential record when none exists, from the
    /// layout hints unless they are `vault://` references, falling back
    /// to the vendor defaults. Already-set credentials are left alone.
    async fn ensure_credentials(&self, bmc: &RouterBmc) {
        let mut creds = match self.device_creds.get(&bmc.xname).await {
            Ok(creds) => creds,
            Err(e) => {
                warn!("Unable to retrieve key {} from secret store: {e}", bmc.xname);
                return;
            }
        };

        if !creds.username.is_empty() && !creds.password.is_empty() {
            return;
        }

        let defaults = match self.cred_store.get_default_credentials().await {
            Ok(defaults) => defaults,
            Err(e) => {
                error!("Unable to get default fabric switch credentials: {e}");
                return;
            }
        };
        let Some(default) = defaults.get(DEFAULT_VENDOR) else {
            error!(
                "No default credentials for {DEFAULT_VENDOR}; cannot seed {}",
                bmc.xname
            );
            return;
        };

        creds.xname = bmc.xname.clone();
        if creds.username.is_empty() {
            creds.username =
                if !bmc.username.is_empty() && !bmc.username.starts_with(VAULT_URL_PREFIX) {
                    bmc.username.clone()
                } else {
                    default.username.clone()
                };
        }
        if creds.password.is_empty() {
            creds.password =
                if !bmc.password.is_empty() && !bmc.password.starts_with(VAULT_URL_PREFIX) {
                    bmc.password.clone()
                } else {
                    default.password.clone()
                };
        }

        match self.device_creds.put(&creds).await {
            Ok(()) => info!("Stored credential for {}", creds.xname),
            Err(e) => error!("Unable to store credentials for switch: {e}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::BmcCredentials;
    use crate::secrets::MemSecretStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn record(extra: serde_json::Value) -> HardwareRecord {
        HardwareRecord {
            xname: "x3000c0r15b0".to_string(),
            extra_properties: extra,
            ..Default::default()
        }
    }

    fn fixture() -> (Arc<FabricDiscovery>, DeviceCredStore, CredentialStore) {
        let secrets = Arc::new(MemSecretStore::new());
        let device_creds = DeviceCredStore::new("device-creds", secrets.clone());
        let cred_store = CredentialStore::new("scout-creds", secrets);
        let topology = Arc::new(
            TopologyClient::new(
                "http://127.0.0.1:0",
                device_creds.clone(),
                cred_store.clone(),
            )
            .unwrap(),
        );
        let inventory = Arc::new(
            InventoryClient::new("http://127.0.0.1:0", "http://127.0.0.1:0").unwrap(),
        );

        let discovery = FabricDiscovery::new(
            topology,
            inventory,
            device_creds.clone(),
            cred_store.clone(),
            Health::new(),
            None,
        )
        .unwrap();
        (discovery, device_creds, cred_store)
    }

    #[test]
    fn test_from_record_filters_dhcp_placeholders() {
        let bmc = RouterBmc::from_record(&record(json!({
            "IP6addr": "DHCPv6",
            "IP4addr": "10.254.2.15",
            "Username": "admin",
        })));
        assert_eq!(bmc.addresses, vec!["10.254.2.15".to_string()]);
        assert_eq!(bmc.username, "admin");

        let bmc = RouterBmc::from_record(&record(json!({
            "IP6addr": "fc00::15",
            "IP4addr": "DHCPv4",
        })));
        assert_eq!(bmc.addresses, vec!["fc00::15".to_string()]);

        let bmc = RouterBmc::from_record(&record(json!({})));
        assert!(bmc.addresses.is_empty());
    }

    #[test]
    fn test_transient_error_classification() {
        let unreachable = Error::UpstreamStatus {
            service: "layout service",
            status: 503,
            body: String::new(),
        };
        assert!(is_transient(&unreachable));

        let bad_payload: Error = serde_json::from_str::<HardwareRecord>("not json")
            .unwrap_err()
            .into();
        assert!(!is_transient(&bad_payload));
    }

    #[tokio::test]
    async fn test_ensure_credentials_prefers_layout_hints() {
        let (discovery, device_creds, cred_store) = fixture();

        let mut defaults = HashMap::new();
        defaults.insert(
            DEFAULT_VENDOR.to_string(),
            BmcCredentials {
                username: "defuser".to_string(),
                password: "defpw".to_string(),
            },
        );
        cred_store.store_default_credentials(&defaults).await.unwrap();

        let bmc = RouterBmc {
            xname: "x3000c0r15b0".to_string(),
            addresses: vec!["10.254.2.15".to_string()],
            username: "admin".to_string(),
            password: "vault://secret/x3000c0r15b0".to_string(),
        };
        discovery.ensure_credentials(&bmc).await;

        // Plain hint wins; vault:// reference falls back to the default
        let stored = device_creds.get("x3000c0r15b0").await.unwrap();
        assert_eq!(stored.username, "admin");
        assert_eq!(stored.password, "defpw");
    }

    #[tokio::test]
    async fn test_ensure_credentials_leaves_existing_alone() {
        let (discovery, device_creds, cred_store) = fixture();

        let mut defaults = HashMap::new();
        defaults.insert(
            DEFAULT_VENDOR.to_string(),
            BmcCredentials {
                username: "defuser".to_string(),
                password: "defpw".to_string(),
            },
        );
        cred_store.store_default_credentials(&defaults).await.unwrap();

        let existing = crate::credentials::DeviceCredentials {
            xname: "x3000c0r15b0".to_string(),
            username: "operator".to_string(),
            password: "rotated0".to_string(),
            ..Default::default()
        };
        device_creds.put(&existing).await.unwrap();

        let bmc = RouterBmc {
            xname: "x3000c0r15b0".to_string(),
            addresses: vec!["10.254.2.15".to_string()],
            username: "admin".to_string(),
            password: "hint".to_string(),
        };
        discovery.ensure_credentials(&bmc).await;

        assert_eq!(device_creds.get("x3000c0r15b0").await.unwrap(), existing);
    }

    #[tokio::test]
    async fn test_watch_without_addresses_exits() {
        let (discovery, _, _) = fixture();
        let bmc = RouterBmc {
            xname: "x3000c0r15b0".to_string(),
            addresses: Vec::new(),
            username: String::new(),
            password: String::new(),
        };
        let token = CancellationToken::new();

        // Returns immediately rather than spinning on an unprobeable BMC
        tokio::time::timeout(
            Duration::from_secs(1),
            discovery.watch_router_bmc(bmc, token),
        )
        .await
        .expect("watch task did not exit");
    }
}
