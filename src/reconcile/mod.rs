//! Discovery state reconciliation
//!
//! Merges the two observation channels into per-device records and
//! decides promotion. The channels are wholly independent producers with
//! no ordering between them, so the merge is commutative: agent-then-
//! network and network-then-agent land in the same final state and
//! trigger promotion exactly once per promotion-eligible transition.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::credentials::{BmcAddress, DeviceCredStore, DeviceCredentials};
use crate::domain::ports::{AddressingNotifier, InventoryBoundary, PortResolver};
use crate::domain::DiscoveryEvent;
use crate::metrics;
use crate::snmp::PortEventKind;
use crate::storage::{DeviceState, StateStore};

// =============================================================================
// Events
// =============================================================================

/// An envelope from one of the two observation channels, consumed exactly
/// once by the reconciliation task.
#[derive(Debug, Clone)]
pub enum Event {
    /// An authenticated in-band report from a booting device's agent.
    AgentReport {
        addresses: Vec<BmcAddress>,
        username: String,
        password: String,
    },
    /// A switch-level MAC learning observation.
    Network {
        switch_name: String,
        mac: String,
        port: String,
        kind: PortEventKind,
    },
}

/// Sender half handed to the HTTP layer and the switch callback.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Creates the channel the reconciler consumes.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded_channel()
}

/// Lowercases a MAC address and strips separator characters so both
/// channels key the same record.
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-' && *c != '.')
        .collect::<String>()
        .to_lowercase()
}

// =============================================================================
// Reconciler
// =============================================================================

/// The per-device state machine over both observation channels.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    resolver: Arc<dyn PortResolver>,
    inventory: Arc<dyn InventoryBoundary>,
    device_creds: DeviceCredStore,
    addressing: Option<Arc<dyn AddressingNotifier>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        resolver: Arc<dyn PortResolver>,
        inventory: Arc<dyn InventoryBoundary>,
        device_creds: DeviceCredStore,
        addressing: Option<Arc<dyn AddressingNotifier>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            inventory,
            device_creds,
            addressing,
        })
    }

    /// Consumes events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::AgentReport {
                    addresses,
                    username,
                    password,
                } => self.on_agent_report(&addresses, &username, &password).await,
                Event::Network {
                    switch_name,
                    mac,
                    port,
                    kind,
                } => self.on_network_event(&switch_name, &mac, &port, kind).await,
            }
        }
        info!("Reconciler event channel closed, shutting down");
    }

    /// Applies an agent report to every MAC it names. Store failures are
    /// logged and the next address is processed; state is idempotently
    /// re-derivable from repeated reports, so no rollback is needed.
    pub async fn on_agent_report(&self, addresses: &[BmcAddress], username: &str, password: &str) {
        for addr in addresses {
            let mac = normalize_mac(&addr.mac_address);

            let mut state = match self.store.get_mac_state(&mac).await {
                Ok(found) => found.unwrap_or_default(),
                Err(e) => {
                    warn!("Error retrieving state for MAC {mac}: {e}");
                    continue;
                }
            };

            state.discovered_agent = true;
            state.username = username.to_string();
            state.password = password.to_string();
            if let Some(ip) = addr
                .ip_addresses
                .iter()
                .map(|ip| ip.address.as_str())
                .find(|a| !a.is_empty())
            {
                state.ip_address = ip.to_string();
            }

            if let Err(e) = self.store.set_mac_state(&mac, &state).await {
                warn!("Unable to store state for MAC {mac}: {e}");
                continue;
            }

            metrics::AGENT_REPORTS.inc();
            DiscoveryEvent::AgentReported {
                mac: mac.clone(),
                timestamp: Utc::now(),
            }
            .audit();

            self.evaluate_readiness(&mac, state).await;
        }
    }

    /// Applies a network observation.
    pub async fn on_network_event(
        &self,
        switch_name: &str,
        mac: &str,
        port: &str,
        kind: PortEventKind,
    ) {
        let kind_label = kind.to_string();
        metrics::NETWORK_EVENTS
            .with_label_values(&[kind_label.as_str()])
            .inc();
        match kind {
            PortEventKind::Add => self.on_network_add(switch_name, mac, port).await,
            PortEventKind::Remove => self.on_network_remove(switch_name, mac, port).await,
        }
    }

    async fn on_network_add(&self, switch_name: &str, mac: &str, port: &str) {
        let mac = normalize_mac(mac);

        // Only ports that resolve to a device identity matter; anything
        // else on the switch (uplinks, unmapped gear) is dropped. The
        // event is transient and recurs on the next scan, so there is no
        // retry here.
        if let Err(e) = self.resolver.resolve(switch_name, port).await {
            debug!("{switch_name}[{port}]: not tracking MAC {mac}: {e}");
            return;
        }

        let mut state = match self.store.get_mac_state(&mac).await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                warn!("Error retrieving state for MAC {mac}: {e}");
                return;
            }
        };

        state.discovered_network = true;
        state.switch_name = switch_name.to_string();
        state.switch_port = port.to_string();

        if let Err(e) = self.store.set_mac_state(&mac, &state).await {
            warn!("Unable to store state for MAC {mac}: {e}");
            return;
        }

        DiscoveryEvent::NetworkAttached {
            mac: mac.clone(),
            switch_name: switch_name.to_string(),
            port: port.to_string(),
            timestamp: Utc::now(),
        }
        .audit();

        self.evaluate_readiness(&mac, state).await;
    }

    /// A MAC vanished from a switch's learned table. Local state is
    /// cleared best-effort; the inventory entry is never disabled on
    /// disappearance, only checked and logged.
    async fn on_network_remove(&self, switch_name: &str, mac: &str, port: &str) {
        let mac = normalize_mac(mac);

        if let Err(e) = self.store.clear_mac_state(&mac).await {
            warn!("Unable to clear state for MAC {mac}: {e}");
        }

        DiscoveryEvent::NetworkDetached {
            mac: mac.clone(),
            switch_name: switch_name.to_string(),
            port: port.to_string(),
            timestamp: Utc::now(),
        }
        .audit();

        // Without an identity there is no inventory entry to examine.
        let xname = match self.resolver.resolve(switch_name, port).await {
            Ok(xname) => xname,
            Err(e) => {
                warn!("{switch_name}[{port}]: cannot resolve removed MAC {mac} to an identity: {e}");
                return;
            }
        };

        match self.inventory.recorded_mac(&xname).await {
            Ok(Some(recorded)) if normalize_mac(&recorded) == mac => {
                info!(
                    "Inventory still records {xname} with MAC {mac}; \
                     disappearance is informational only"
                );
            }
            Ok(Some(recorded)) => {
                info!(
                    "Removed MAC {mac} does not match inventory record for {xname} \
                     (currently {recorded})"
                );
            }
            Ok(None) => {
                debug!("{xname} is not present in inventory");
            }
            Err(e) => {
                warn!("Unable to query inventory for {xname}: {e}");
            }
        }
    }

    /// Invariant check run after every state mutation: when both channels
    /// have seen the device, promote it and drop the agent-sourced
    /// fields. The inventory notification runs on its own task so the
    /// caller never stalls on the boundary.
    async fn evaluate_readiness(&self, mac: &str, mut state: DeviceState) {
        if !state.ready_for_promotion() {
            return;
        }

        let xname = match self
            .resolver
            .resolve(&state.switch_name, &state.switch_port)
            .await
        {
            Ok(xname) => xname,
            Err(e) => {
                // State stays pending; the next triggering event retries.
                warn!(
                    "MAC {mac} is ready but {}[{}] does not resolve, \
                     aborting this promotion attempt: {e}",
                    state.switch_name, state.switch_port
                );
                return;
            }
        };

        info!(
            "We discovered {xname} on {} port {}",
            state.switch_name, state.switch_port
        );

        let inventory = self.inventory.clone();
        let addressing = self.addressing.clone();
        let device_creds = self.device_creds.clone();
        let promoted_mac = mac.to_string();
        let username = state.username.clone();
        let password = state.password.clone();
        let ip_address = state.ip_address.clone();
        tokio::spawn(async move {
            // Credentials go to the secret store; the registration itself
            // carries blank fields.
            if !username.is_empty() {
                let creds = DeviceCredentials {
                    xname: xname.clone(),
                    username,
                    password,
                    ..Default::default()
                };
                if let Err(e) = device_creds.put(&creds).await {
                    // Losing this write leaves the endpoint registered
                    // with no stored credentials; flag it loudly.
                    warn!("Failed to store credentials for {xname} in secret store: {e}");
                }
            }

            match inventory
                .notify_discovered(&xname, &promoted_mac, &ip_address)
                .await
            {
                Ok(true) => {
                    metrics::PROMOTIONS.inc();
                    DiscoveryEvent::DevicePromoted {
                        xname: xname.clone(),
                        mac: promoted_mac.clone(),
                        timestamp: Utc::now(),
                    }
                    .audit();
                }
                Ok(false) => {
                    metrics::PROMOTION_FAILURES.inc();
                }
                Err(e) => {
                    warn!("Unable to notify inventory about {xname}: {e}");
                    metrics::PROMOTION_FAILURES.inc();
                }
            }

            if let Some(addressing) = addressing {
                if let Err(e) = addressing
                    .notify_ready(&xname, &promoted_mac, &ip_address)
                    .await
                {
                    warn!("Address-management notification for {xname} failed: {e}");
                }
            }
        });

        // Clearing the agent fields makes repeat network signals
        // harmless and lets a later agent re-report (say, a node reboot
        // before conclusion) re-trigger promotion cleanly.
        state.clear_agent_fields();
        if let Err(e) = self.store.set_mac_state(mac, &state).await {
            warn!("Unable to store post-promotion state for MAC {mac}: {e}");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::secrets::MemSecretStore;
    use crate::storage::MemStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Resolver over a fixed (switch, port) -> xname table.
    struct FixedResolver {
        table: HashMap<(String, String), String>,
    }

    impl FixedResolver {
        fn with(entries: &[(&str, &str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                table: entries
                    .iter()
                    .map(|(s, p, x)| ((s.to_string(), p.to_string()), x.to_string()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl PortResolver for FixedResolver {
        async fn resolve(&self, switch_name: &str, port: &str) -> Result<String> {
            self.table
                .get(&(switch_name.to_string(), port.to_string()))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no port {port} on switch {switch_name}")))
        }
    }

    /// Inventory boundary that counts notifications.
    #[derive(Default)]
    struct CountingInventory {
        notified: AtomicUsize,
        promoted: Mutex<Vec<(String, String)>>,
        recorded: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl InventoryBoundary for CountingInventory {
        async fn notify_discovered(&self, xname: &str, mac: &str, _ip: &str) -> Result<bool> {
            self.notified.fetch_add(1, Ordering::SeqCst);
            self.promoted
                .lock()
                .push((xname.to_string(), mac.to_string()));
            Ok(true)
        }

        async fn recorded_mac(&self, xname: &str) -> Result<Option<String>> {
            Ok(self.recorded.lock().get(xname).cloned())
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        inventory: Arc<CountingInventory>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let inventory = Arc::new(CountingInventory::default());
        let resolver = FixedResolver::with(&[("x3000c0w14", "ethernet1/1/3", "x3000c0s28b0")]);
        let device_creds = DeviceCredStore::new("device-creds", Arc::new(MemSecretStore::new()));

        let reconciler = Reconciler::new(
            store.clone(),
            resolver,
            inventory.clone(),
            device_creds,
            None,
        );
        Fixture {
            store,
            inventory,
            reconciler,
        }
    }

    fn agent_addrs(mac: &str) -> Vec<BmcAddress> {
        vec![BmcAddress {
            mac_address: mac.to_string(),
            ip_addresses: vec![crate::credentials::IpAddress {
                address_type: "IPv4".to_string(),
                address: "10.254.1.20".to_string(),
            }],
        }]
    }

    async fn settle() {
        // Promotion runs on a spawned task
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_agent_report_alone_never_promotes() {
        let f = fixture();
        f.reconciler
            .on_agent_report(&agent_addrs("00:1C:ED:C0:FF:EE"), "root", "initial0")
            .await;
        settle().await;

        let state = f
            .store
            .get_mac_state("001cedc0ffee")
            .await
            .unwrap()
            .unwrap();
        assert!(state.discovered_agent);
        assert!(!state.discovered_network);
        assert_eq!(state.username, "root");
        assert_eq!(state.ip_address, "10.254.1.20");
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_add_alone_never_promotes() {
        let f = fixture();
        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        settle().await;

        let state = f
            .store
            .get_mac_state("001cedc0ffee")
            .await
            .unwrap()
            .unwrap();
        assert!(!state.discovered_agent);
        assert!(state.discovered_network);
        assert_eq!(state.switch_name, "x3000c0w14");
        assert_eq!(state.switch_port, "ethernet1/1/3");
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_both_channels_promote_exactly_once() {
        let f = fixture();
        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        f.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        settle().await;

        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.inventory.promoted.lock()[0],
            ("x3000c0s28b0".to_string(), "001cedc0ffee".to_string())
        );

        // Post-promotion: agent fields cleared, network linkage retained
        let state = f
            .store
            .get_mac_state("001cedc0ffee")
            .await
            .unwrap()
            .unwrap();
        assert!(!state.discovered_agent);
        assert!(state.discovered_network);
        assert_eq!(state.switch_name, "x3000c0w14");
        assert!(state.username.is_empty());
        assert!(state.password.is_empty());
    }

    #[tokio::test]
    async fn test_merge_is_commutative() {
        // agent-then-network
        let f1 = fixture();
        f1.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        f1.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        settle().await;

        // network-then-agent
        let f2 = fixture();
        f2.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        f2.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        settle().await;

        let s1 = f1.store.get_mac_state("001cedc0ffee").await.unwrap();
        let s2 = f2.store.get_mac_state("001cedc0ffee").await.unwrap();
        assert_eq!(s1, s2);
        assert_eq!(f1.inventory.notified.load(Ordering::SeqCst), 1);
        assert_eq!(f2.inventory.notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeat_reports_are_idempotent() {
        let f = fixture();
        for _ in 0..3 {
            f.reconciler
                .on_network_event(
                    "x3000c0w14",
                    "001cedc0ffee",
                    "ethernet1/1/3",
                    PortEventKind::Add,
                )
                .await;
        }
        let after_net = f.store.get_mac_state("001cedc0ffee").await.unwrap();

        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        assert_eq!(
            f.store.get_mac_state("001cedc0ffee").await.unwrap(),
            after_net
        );

        // Duplicate agent reports after promotion each re-trigger a full
        // promotion cycle (a fresh promotion-eligible transition), but
        // duplicates of an un-promotable state change nothing.
        f.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        settle().await;
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 1);

        // Repeat network adds after promotion do not promote again
        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        settle().await;
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_agent_rereport_retriggers_promotion() {
        let f = fixture();
        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        f.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        settle().await;
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 1);

        // The node rebooted before concluding and reports again; no new
        // network observation is required.
        f.reconciler
            .on_agent_report(&agent_addrs("001cedc0ffee"), "root", "initial0")
            .await;
        settle().await;
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_port_drops_add_event() {
        let f = fixture();
        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "mgmt1/1/1", PortEventKind::Add)
            .await;

        // Dropped: no state was created for the unresolvable port
        assert_eq!(f.store.get_mac_state("001cedc0ffee").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unresolvable_promotion_stays_pending() {
        let store = Arc::new(MemStore::new());
        let inventory = Arc::new(CountingInventory::default());
        // Empty resolver: the layout service has no record of this port
        let resolver = FixedResolver::with(&[]);
        let device_creds = DeviceCredStore::new("device-creds", Arc::new(MemSecretStore::new()));
        let reconciler = Reconciler::new(
            store.clone(),
            resolver,
            inventory.clone(),
            device_creds,
            None,
        );

        let state = DeviceState {
            discovered_agent: true,
            discovered_network: true,
            switch_name: "x3000c0w14".to_string(),
            switch_port: "ethernet1/1/3".to_string(),
            username: "root".to_string(),
            password: "initial0".to_string(),
            ip_address: "10.254.1.20".to_string(),
        };
        store.set_mac_state("001cedc0ffee", &state).await.unwrap();

        reconciler
            .evaluate_readiness("001cedc0ffee", state.clone())
            .await;
        settle().await;

        // No promotion, and the record still carries both flags so the
        // next event retries.
        assert_eq!(inventory.notified.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get_mac_state("001cedc0ffee").await.unwrap(),
            Some(state)
        );
    }

    #[tokio::test]
    async fn test_remove_clears_state_and_checks_inventory() {
        let f = fixture();
        f.inventory.recorded.lock().insert(
            "x3000c0s28b0".to_string(),
            "001cedc0ffee".to_string(),
        );

        f.reconciler
            .on_network_event("x3000c0w14", "001cedc0ffee", "ethernet1/1/3", PortEventKind::Add)
            .await;
        assert!(f
            .store
            .get_mac_state("001cedc0ffee")
            .await
            .unwrap()
            .is_some());

        f.reconciler
            .on_network_event(
                "x3000c0w14",
                "001cedc0ffee",
                "ethernet1/1/3",
                PortEventKind::Remove,
            )
            .await;
        settle().await;

        // State cleared, but no inventory mutation on disappearance
        assert_eq!(f.store.get_mac_state("001cedc0ffee").await.unwrap(), None);
        assert_eq!(f.inventory.notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("A4:BF:00:2B:6E:FF"), "a4bf002b6eff");
        assert_eq!(normalize_mac("a4-bf-00-2b-6e-ff"), "a4bf002b6eff");
        assert_eq!(normalize_mac("a4bf.002b.6eff"), "a4bf002b6eff");
        assert_eq!(normalize_mac("a4bf002b6eff"), "a4bf002b6eff");
    }
}
