//! Topology change watchers
//!
//! Two background loops poll the layout service: one for the management
//! switch inventory, one for management-role nodes. Switch set membership
//! changes fan out to registered callbacks through [`TopologyNotifier`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{normalize_role, normalize_subrole, Switch, TopologyClient};
use crate::credentials::{CredentialStore, DeviceCredStore, DeviceCredentials, DEFAULT_VENDOR};
use crate::domain::DiscoveryEvent;
use crate::health::Health;
use crate::inventory::{Component, EndpointRegistration, InventoryClient};
use crate::metrics;

/// Bounded exponential backoff for failed polls.
fn poll_backoff(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(6);
    Duration::from_secs(5u64 << exp).min(Duration::from_secs(300))
}

// =============================================================================
// Change notification
// =============================================================================

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Owned registry of change callbacks, replacing package-level shared
/// state with an object passed by reference.
#[derive(Default)]
pub struct TopologyNotifier {
    callbacks: Mutex<Vec<Callback>>,
}

impl TopologyNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a callback to run whenever switch set membership changes.
    pub fn on_change(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(cb));
    }

    /// Fires every registered callback, one spawned task each, so a slow
    /// subscriber never blocks the poll loop.
    pub fn notify(&self) {
        let callbacks: Vec<Callback> = self.callbacks.lock().clone();
        for cb in callbacks {
            tokio::spawn(async move {
                cb();
            });
        }
    }
}

// =============================================================================
// Switch watcher
// =============================================================================

/// Polls the layout service for the switch inventory and notifies
/// subscribers when set membership changes (additions or removals, not
/// field churn within an existing entry).
pub async fn watch_switches(
    client: Arc<TopologyClient>,
    notifier: Arc<TopologyNotifier>,
    health: Arc<Health>,
    poll_period: Duration,
    token: CancellationToken,
) {
    let mut switches: HashMap<String, Switch> = HashMap::new();
    let mut failures: u32 = 0;

    loop {
        let delay = if failures == 0 {
            poll_period
        } else {
            poll_backoff(failures)
        };

        tokio::select! {
            _ = token.cancelled() => {
                info!("Switch watcher shutting down");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        trace!("Getting list of new switches");
        let new_switches = match client.get_switches().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Unable to get new switch list: {e}");
                failures += 1;
                continue;
            }
        };
        failures = 0;
        health.set_topology_read();
        metrics::TOPOLOGY_POLLS.inc();

        let mut changed = false;
        for key in new_switches.keys() {
            if !switches.contains_key(key) {
                info!("Found new switch {key}");
                changed = true;
            }
        }
        for key in switches.keys() {
            if !new_switches.contains_key(key) {
                info!("Found removed switch {key}");
                changed = true;
            }
        }

        if changed {
            switches = new_switches;
            DiscoveryEvent::TopologyEpoch {
                switch_count: switches.len(),
                timestamp: Utc::now(),
            }
            .audit();
            info!("Switch set changed, calling callbacks");
            notifier.notify();
        } else {
            trace!("No switch set changes, not calling callbacks");
        }
    }
}

// =============================================================================
// Management node watcher
// =============================================================================

/// Polls the layout service for management-role nodes and registers their
/// BMCs with the inventory service. Master management nodes whose BMC has
/// no switch connector are seeded directly into the component list, since
/// no switch-port path exists to discover them through.
pub async fn watch_management_nodes(
    topology: Arc<TopologyClient>,
    inventory: Arc<InventoryClient>,
    device_creds: DeviceCredStore,
    cred_store: CredentialStore,
    poll_period: Duration,
    token: CancellationToken,
) {
    // Local cache of BMCs already sent, so the inventory service is not
    // hammered with repeat registrations.
    let mut known_bmcs: HashSet<String> = HashSet::new();
    let mut failures: u32 = 0;

    loop {
        let delay = if failures == 0 {
            poll_period
        } else {
            poll_backoff(failures)
        };

        tokio::select! {
            _ = token.cancelled() => {
                info!("Management nodes watcher shutting down");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        trace!("Getting list of new management nodes");
        let nodes = match topology.get_management_nodes().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Unable to get new node list: {e}");
                failures += 1;
                continue;
            }
        };
        failures = 0;

        for node in nodes {
            // The xname field is the node itself; the parent is the BMC
            // we register.
            let bmc = node.parent.clone();
            if bmc.is_empty() || known_bmcs.contains(&bmc) {
                continue;
            }

            info!("Found new management node {} (BMC {bmc})", node.xname);

            let connectors = match topology.get_connectors_by_bmc(&bmc).await {
                Ok(c) => c,
                Err(e) => {
                    error!(
                        "Unable to get node connector info from layout service, \
                         not adding nodes in {bmc} for now: {e}"
                    );
                    continue;
                }
            };

            // Leave already-set credentials alone in case they were
            // changed from the defaults.
            let credentials = match device_creds.get(&bmc).await {
                Ok(c) => c,
                Err(e) => {
                    error!(
                        "Unable to check secret store for credentials, \
                         not adding node {bmc} for now: {e}"
                    );
                    continue;
                }
            };

            if credentials.username.is_empty() || credentials.password.is_empty() {
                let defaults = match cred_store.get_default_credentials().await {
                    Ok(d) => d,
                    Err(e) => {
                        error!("Unable to get default credentials, not adding node {bmc} for now: {e}");
                        continue;
                    }
                };
                let Some(default) = defaults.get(DEFAULT_VENDOR) else {
                    error!("No default credentials for {DEFAULT_VENDOR}, not adding node {bmc} for now");
                    continue;
                };

                let seeded = DeviceCredentials {
                    xname: bmc.clone(),
                    username: default.username.clone(),
                    password: default.password.clone(),
                    ..Default::default()
                };
                if let Err(e) = device_creds.put(&seeded).await {
                    error!("Unable to set credentials, not adding node {bmc} for now: {e}");
                    continue;
                }
                debug!("Set credentials for {bmc}");
            }

            // Master management nodes with no switch connector get
            // injected straight into the component list; they have no
            // switch-port path to be discovered through.
            if connectors.is_empty() {
                let role = node.extra_str("Role").and_then(normalize_role);
                let subrole = node.extra_str("SubRole").and_then(normalize_subrole);

                if role == Some("Management") && subrole == Some("Master") {
                    let component = Component {
                        id: node.xname.clone(),
                        state: "Populated".to_string(),
                        role: "Management".to_string(),
                        sub_role: "Master".to_string(),
                        nid: node.extra_number("NID"),
                        net_type: "Sling".to_string(),
                        arch: "X86".to_string(),
                        class: node.class.clone(),
                    };
                    if let Err(e) = inventory.create_component(component).await {
                        warn!("Unable to create component for {}: {e}", node.xname);
                    }
                }
            }

            let registration = EndpointRegistration {
                id: bmc.clone(),
                rediscover_on_update: true,
                ..Default::default()
            };
            match inventory.register_endpoint(&registration).await {
                Ok(true) => {
                    known_bmcs.insert(bmc);
                }
                Ok(false) => {}
                Err(e) => warn!("Unable to register management BMC {bmc}: {e}"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_poll_backoff_is_bounded() {
        assert_eq!(poll_backoff(1), Duration::from_secs(5));
        assert_eq!(poll_backoff(2), Duration::from_secs(10));
        assert_eq!(poll_backoff(3), Duration::from_secs(20));
        assert_eq!(poll_backoff(50), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_notifier_fires_all_callbacks() {
        let notifier = TopologyNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            notifier.on_change(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        notifier.notify();
        // Callbacks run on spawned tasks; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
