//! End-to-end reconciliation flow over in-memory adapters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use riverscout::credentials::{BmcAddress, DeviceCredStore, IpAddress};
use riverscout::domain::ports::{InventoryBoundary, PortResolver};
use riverscout::error::{Error, Result};
use riverscout::reconcile::{event_channel, Event, Reconciler};
use riverscout::secrets::MemSecretStore;
use riverscout::snmp::PortEventKind;
use riverscout::storage::{MemStore, StateStore};

struct TableResolver {
    table: HashMap<(String, String), String>,
}

#[async_trait]
impl PortResolver for TableResolver {
    async fn resolve(&self, switch_name: &str, port: &str) -> Result<String> {
        self.table
            .get(&(switch_name.to_string(), port.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no port {port} on switch {switch_name}")))
    }
}

#[derive(Default)]
struct RecordingInventory {
    notifications: AtomicUsize,
    registered: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl InventoryBoundary for RecordingInventory {
    async fn notify_discovered(&self, xname: &str, mac: &str, ip: &str) -> Result<bool> {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        self.registered
            .lock()
            .push((xname.to_string(), mac.to_string(), ip.to_string()));
        Ok(true)
    }

    async fn recorded_mac(&self, _xname: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

struct Harness {
    store: Arc<MemStore>,
    inventory: Arc<RecordingInventory>,
    device_creds: DeviceCredStore,
    events: riverscout::reconcile::EventSender,
}

fn start_harness() -> Harness {
    let store = Arc::new(MemStore::new());
    let inventory = Arc::new(RecordingInventory::default());
    let device_creds = DeviceCredStore::new("device-creds", Arc::new(MemSecretStore::new()));

    let mut table = HashMap::new();
    table.insert(
        ("x3000c0w14".to_string(), "ethernet1/1/20".to_string()),
        "x3000c0s20b0".to_string(),
    );
    let resolver = Arc::new(TableResolver { table });

    let reconciler = Reconciler::new(
        store.clone(),
        resolver,
        inventory.clone(),
        device_creds.clone(),
        None,
    );

    let (events, rx) = event_channel();
    tokio::spawn(reconciler.run(rx));

    Harness {
        store,
        inventory,
        device_creds,
        events,
    }
}

fn agent_report(mac: &str) -> Event {
    Event::AgentReport {
        addresses: vec![BmcAddress {
            mac_address: mac.to_string(),
            ip_addresses: vec![IpAddress {
                address_type: "IPv4".to_string(),
                address: "10.254.1.20".to_string(),
            }],
        }],
        username: "root".to_string(),
        password: "initial0".to_string(),
    }
}

fn network_event(mac: &str, kind: PortEventKind) -> Event {
    Event::Network {
        switch_name: "x3000c0w14".to_string(),
        mac: mac.to_string(),
        port: "ethernet1/1/20".to_string(),
        kind,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn full_discovery_promotes_once_and_stores_credentials() {
    let h = start_harness();

    h.events
        .send(network_event("a4:bf:00:2b:6e:ff", PortEventKind::Add))
        .unwrap();
    h.events.send(agent_report("a4:bf:00:2b:6e:ff")).unwrap();
    settle().await;

    // Exactly one promotion, with the resolved identity and the
    // normalized MAC
    assert_eq!(h.inventory.notifications.load(Ordering::SeqCst), 1);
    let registered = h.inventory.registered.lock().clone();
    assert_eq!(
        registered[0],
        (
            "x3000c0s20b0".to_string(),
            "a4bf002b6eff".to_string(),
            "10.254.1.20".to_string()
        )
    );

    // Credentials landed in the per-device secret store
    let creds = h.device_creds.get("x3000c0s20b0").await.unwrap();
    assert_eq!(creds.username, "root");
    assert_eq!(creds.password, "initial0");

    // Agent fields cleared; network linkage retained
    let state = h
        .store
        .get_mac_state("a4bf002b6eff")
        .await
        .unwrap()
        .unwrap();
    assert!(!state.discovered_agent);
    assert!(state.discovered_network);
    assert!(state.password.is_empty());
    assert_eq!(state.switch_name, "x3000c0w14");
}

#[tokio::test]
async fn duplicate_events_from_both_channels_promote_once() {
    let h = start_harness();

    for _ in 0..3 {
        h.events
            .send(network_event("a4bf002b6eff", PortEventKind::Add))
            .unwrap();
    }
    h.events.send(agent_report("a4bf002b6eff")).unwrap();
    for _ in 0..3 {
        h.events
            .send(network_event("a4bf002b6eff", PortEventKind::Add))
            .unwrap();
    }
    settle().await;

    assert_eq!(h.inventory.notifications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn order_of_channels_does_not_matter() {
    let h1 = start_harness();
    h1.events.send(agent_report("001cedc0ffee")).unwrap();
    h1.events
        .send(network_event("001cedc0ffee", PortEventKind::Add))
        .unwrap();
    settle().await;

    let h2 = start_harness();
    h2.events
        .send(network_event("001cedc0ffee", PortEventKind::Add))
        .unwrap();
    h2.events.send(agent_report("001cedc0ffee")).unwrap();
    settle().await;

    assert_eq!(h1.inventory.notifications.load(Ordering::SeqCst), 1);
    assert_eq!(h2.inventory.notifications.load(Ordering::SeqCst), 1);

    let s1 = h1.store.get_mac_state("001cedc0ffee").await.unwrap();
    let s2 = h2.store.get_mac_state("001cedc0ffee").await.unwrap();
    assert_eq!(s1, s2);
}

#[tokio::test]
async fn remove_event_clears_device_state() {
    let h = start_harness();

    h.events
        .send(network_event("001cedc0ffee", PortEventKind::Add))
        .unwrap();
    settle().await;
    assert!(h
        .store
        .get_mac_state("001cedc0ffee")
        .await
        .unwrap()
        .is_some());

    h.events
        .send(network_event("001cedc0ffee", PortEventKind::Remove))
        .unwrap();
    settle().await;

    assert_eq!(h.store.get_mac_state("001cedc0ffee").await.unwrap(), None);
    // Disappearance never mutates inventory
    assert_eq!(h.inventory.notifications.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_channel_alone_never_promotes() {
    let h = start_harness();

    h.events.send(agent_report("001cedc0ff01")).unwrap();
    h.events
        .send(network_event("001cedc0ff02", PortEventKind::Add))
        .unwrap();
    settle().await;

    assert_eq!(h.inventory.notifications.load(Ordering::SeqCst), 0);
}
