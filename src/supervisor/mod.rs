//! Switch Watcher Supervisor
//!
//! Owns one scan task per known switch and reacts to topology-change
//! notifications by diffing the running set against the desired set.
//! Cancellation is cooperative and per-switch: each scan loop races its
//! timer against its own cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::DiscoveryEvent;
use crate::metrics;
use crate::reconcile::{Event, EventSender};
use crate::snmp::dell::DellOsDriver;
use crate::snmp::session::SessionFactory;
use crate::snmp::{PortCallback, PortEventKind, SwitchDriver};
use crate::storage::{StateStore, SwitchMacTable};
use crate::topology::TopologyClient;

// =============================================================================
// Per-switch runtime
// =============================================================================

/// Lifecycle state of one switch's scan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Unknown,
    Initializing,
    Running,
    Stopping,
}

/// The live scanning task for one switch.
struct SwitchRuntime {
    state: SwitchState,
    token: CancellationToken,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Lifecycle manager for the per-switch scan tasks.
pub struct SwitchSupervisor {
    topology: Arc<TopologyClient>,
    store: Arc<dyn StateStore>,
    sessions: SessionFactory,
    events: EventSender,
    scan_period: Duration,
    /// Start a degraded scan task even when driver initialization fails
    bypass_init_failure: bool,
    running: DashMap<String, SwitchRuntime>,
}

impl SwitchSupervisor {
    pub fn new(
        topology: Arc<TopologyClient>,
        store: Arc<dyn StateStore>,
        sessions: SessionFactory,
        events: EventSender,
        scan_period: Duration,
        bypass_init_failure: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology,
            store,
            sessions,
            events,
            scan_period,
            bypass_init_failure,
            running: DashMap::new(),
        })
    }

    /// Current lifecycle state for a switch.
    pub fn switch_state(&self, name: &str) -> SwitchState {
        self.running
            .get(name)
            .map(|r| r.state)
            .unwrap_or(SwitchState::Unknown)
    }

    /// Consumes refresh signals until the channel closes or the token
    /// fires. Each signal means "the switch set may have changed".
    pub async fn run(
        self: Arc<Self>,
        mut refresh: mpsc::UnboundedReceiver<()>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                signal = refresh.recv() => match signal {
                    Some(()) => self.handle_topology_change().await,
                    None => break,
                },
            }
        }

        info!("Switch supervisor shutting down, stopping all scan tasks");
        for entry in self.running.iter() {
            entry.value().token.cancel();
        }
        self.running.clear();
    }

    /// Diffs the desired switch set against the running set, starting and
    /// stopping scan tasks as needed.
    async fn handle_topology_change(&self) {
        let desired = match self.topology.get_switches().await {
            Ok(switches) => switches,
            Err(e) => {
                warn!("Unable to reconcile scan tasks: can't get new switch list: {e}");
                return;
            }
        };

        let vanished: Vec<String> = self
            .running
            .iter()
            .filter(|entry| !desired.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in vanished {
            self.stop_switch(&name).await;
        }

        for name in desired.keys() {
            if !self.running.contains_key(name) {
                self.start_switch(name).await;
            }
        }
    }

    /// Instantiates and initializes a driver for a new switch, then
    /// starts its scan task. Initialization failure drops the switch for
    /// this epoch unless bypass is configured.
    async fn start_switch(&self, name: &str) {
        let token = CancellationToken::new();
        self.running.insert(
            name.to_string(),
            SwitchRuntime {
                state: SwitchState::Initializing,
                token: token.clone(),
            },
        );

        let mut driver: Box<dyn SwitchDriver> = Box::new(DellOsDriver::new(
            self.topology.clone(),
            self.sessions.clone(),
        ));

        if let Err(e) = driver.init(name, self.store.clone()).await {
            if self.bypass_init_failure {
                warn!("Failed to initialize switch {name}, but proceeding after error: {e}");
            } else {
                warn!("Unable to initialize switch {name} due to error: {e}");
                self.running.remove(name);
                return;
            }
        } else {
            info!("Initialized switch {name}");
        }

        if let Some(mut entry) = self.running.get_mut(name) {
            entry.state = SwitchState::Running;
        }

        let cb = port_callback(self.events.clone());
        let period = self.scan_period;
        let switch_name = name.to_string();
        tokio::spawn(async move {
            run_scan_loop(driver, switch_name, cb, period, token).await;
        });
    }

    /// Signals a vanished switch's scan task to stop and clears the
    /// network-side state recorded against it, so its devices are
    /// rediscovered fresh if the switch returns.
    async fn stop_switch(&self, name: &str) {
        if let Some(mut entry) = self.running.get_mut(name) {
            entry.state = SwitchState::Stopping;
            // cancel() never blocks, even if the task is mid-scan and not
            // currently listening.
            entry.token.cancel();
        }
        self.running.remove(name);
        info!("Stopped scan task for removed switch {name}");

        self.clear_switch_network_state(name).await;
    }

    /// Clears the network-discovery half of every MAC recorded against a
    /// switch and resets its stored table, forcing re-discovery.
    async fn clear_switch_network_state(&self, name: &str) {
        let table = match self.store.get_switch_state(name).await {
            Ok(Some(table)) => table,
            Ok(None) => return,
            Err(e) => {
                warn!("Unable to load stored table for {name}: {e}");
                return;
            }
        };

        for mac in table.keys() {
            let mut state = match self.store.get_mac_state(mac).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    debug!("No stored state for MAC {mac} while resetting {name}");
                    continue;
                }
                Err(e) => {
                    warn!("Error retrieving state for MAC {mac}: {e}");
                    continue;
                }
            };

            state.discovered_network = false;
            state.switch_name.clear();
            state.switch_port.clear();
            if let Err(e) = self.store.set_mac_state(mac, &state).await {
                warn!("Unable to reset state for MAC {mac}: {e}");
            }
        }

        if let Err(e) = self
            .store
            .set_switch_state(name, &SwitchMacTable::new())
            .await
        {
            warn!("Unable to reset stored table for {name}: {e}");
        }
    }
}

// =============================================================================
// Scan loop
// =============================================================================

/// Builds the callback the drivers fire per detected change; each event
/// is forwarded to the reconciler's channel.
fn port_callback(events: EventSender) -> PortCallback {
    Arc::new(move |kind, switch_name, mac, port| {
        match kind {
            PortEventKind::Add => debug!("{switch_name}: added {mac} on {port}"),
            PortEventKind::Remove => debug!("{switch_name}: removed {mac} on {port}"),
        }
        let _ = events.send(Event::Network {
            switch_name: switch_name.to_string(),
            mac: mac.to_string(),
            port: port.to_string(),
            kind,
        });
    })
}

/// One switch's periodic scan loop: race the timer against cancellation,
/// whichever is ready first. Cancellation is only observed between scan
/// cycles; an in-flight cycle finishes.
async fn run_scan_loop(
    mut driver: Box<dyn SwitchDriver>,
    switch_name: String,
    cb: PortCallback,
    period: Duration,
    token: CancellationToken,
) {
    info!("Starting periodic scan job for {switch_name}");
    DiscoveryEvent::ScanStarted {
        switch_name: switch_name.clone(),
        timestamp: Utc::now(),
    }
    .audit();
    metrics::RUNNING_SCANNERS.inc();

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Stopping periodic scan job for {switch_name}");
                break;
            }
            _ = ticker.tick() => {
                debug!("Running periodic scan for {switch_name}");
                driver.periodic_scan(&cb).await;
            }
        }
    }

    metrics::RUNNING_SCANNERS.dec();
    DiscoveryEvent::ScanStopped {
        switch_name,
        timestamp: Utc::now(),
    }
    .audit();
}

// =============================================================================
// Tests
// =============================================================================
