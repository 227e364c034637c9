//! riverscout - Hardware Discovery Coordinator
//!
//! Service entry point: wires the state store, secret store, topology
//! watchers, switch supervisor, reconciler, and the management and
//! metrics servers together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use riverscout::addressing::AddressingClient;
use riverscout::credentials::{CredentialStore, DeviceCredStore};
use riverscout::domain::ports::AddressingNotifier;
use riverscout::fabric::nwprotocol::NetworkProtocolSettings;
use riverscout::fabric::FabricDiscovery;
use riverscout::health::Health;
use riverscout::http::ApiContext;
use riverscout::inventory::InventoryClient;
use riverscout::reconcile::{event_channel, Reconciler};
use riverscout::secrets::{MemSecretStore, SecretStore, VaultSecretStore};
use riverscout::snmp::session::net_snmp_factory;
use riverscout::supervisor::SwitchSupervisor;
use riverscout::topology::watcher::{watch_management_nodes, watch_switches, TopologyNotifier};
use riverscout::topology::TopologyClient;
use riverscout::{http, metrics, storage};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hardware discovery coordinator for river-class management networks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Management API bind address
    #[arg(long, env = "HTTP_LISTEN", default_value = "0.0.0.0:8269")]
    http_listen: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8270")]
    metrics_addr: String,

    /// Inventory service base URL
    #[arg(long, env = "INVENTORY_URL", default_value = "http://inventory-svc/hsm/v2")]
    inventory_url: String,

    /// Boot service base URL (resynchronized after disable operations)
    #[arg(long, env = "BOOT_URL", default_value = "http://boot-svc/boot/v1")]
    boot_url: String,

    /// Layout service base URL
    #[arg(long, env = "LAYOUT_URL", default_value = "http://layout-svc/v1")]
    layout_url: String,

    /// Datastore URL ("sqlite:<path>" or "mem:")
    #[arg(long, env = "DATASTORE_URL", default_value = "sqlite:/var/lib/riverscout/state.db")]
    datastore_url: String,

    /// Address-management notification URL (optional)
    #[arg(long, env = "ADDRESSING_URL")]
    addressing_url: Option<String>,

    /// How frequently each switch is rescanned for new and removed
    /// hardware (seconds)
    #[arg(long, env = "SCAN_PERIOD_SECONDS", default_value = "60")]
    scan_period_seconds: u64,

    /// How frequently the layout service is polled for topology changes
    /// (seconds)
    #[arg(long, env = "TOPOLOGY_POLL_SECONDS", default_value = "30")]
    topology_poll_seconds: u64,

    /// Start a degraded scan task even when switch initialization fails
    #[arg(long, env = "BYPASS_SWITCH_INIT_FAILURE")]
    bypass_switch_init_failure: bool,

    /// host[,host...]:port of the syslog aggregator to set on fabric
    /// switch BMCs
    #[arg(long, env = "SYSLOG_TARGET", default_value = "")]
    syslog: String,

    /// host[,host...]:port of the NTP service to set on fabric switch
    /// BMCs
    #[arg(long, env = "NTP_TARGET", default_value = "")]
    ntp: String,

    /// SSH authorized key to install on fabric switch BMCs
    #[arg(long, env = "FABRIC_SSH_KEY", default_value = "")]
    fabric_ssh_key: String,

    /// URL path for the network options Redfish endpoint on fabric
    /// switch BMCs
    #[arg(
        long,
        env = "NP_RF_URL",
        default_value = "/redfish/v1/Managers/BMC/NetworkProtocol"
    )]
    np_rf_url: String,

    /// Use an in-memory secret store instead of Vault (local runs only)
    #[arg(long, env = "INSECURE_SECRETS")]
    insecure_secrets: bool,

    /// Secret store mount point
    #[arg(long, env = "SECRETS_MOUNT", default_value = "secret")]
    secrets_mount: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting riverscout");
    info!("  Management API: {}", args.http_listen);
    info!("  Inventory service: {}", args.inventory_url);
    info!("  Layout service: {}", args.layout_url);
    info!("  Datastore: {}", args.datastore_url);
    info!("  Scan period: {}s", args.scan_period_seconds);
    info!("  Topology poll: {}s", args.topology_poll_seconds);
    info!("  Bypass switch init failure: {}", args.bypass_switch_init_failure);

    // The state store is the one dependency nothing can proceed without.
    let store = storage::make_store(&args.datastore_url)
        .context("can't connect to backing storage")?;
    info!("Connected to state store");

    let secrets: Arc<dyn SecretStore> = if args.insecure_secrets {
        info!("Using in-memory secret store (NOT for production)");
        Arc::new(MemSecretStore::new())
    } else {
        info!("Connecting to secure store (Vault)...");
        let vault = VaultSecretStore::from_env(&args.secrets_mount)
            .context("secure store connection failed")?;
        info!("Connection to secure store (Vault) succeeded");
        Arc::new(vault)
    };

    let cred_store = CredentialStore::new("scout-creds", secrets.clone());
    let device_creds = DeviceCredStore::new("device-creds", secrets);

    let topology = Arc::new(TopologyClient::new(
        &args.layout_url,
        device_creds.clone(),
        cred_store.clone(),
    )?);
    let inventory = Arc::new(InventoryClient::new(&args.inventory_url, &args.boot_url)?);

    let addressing: Option<Arc<dyn AddressingNotifier>> = match &args.addressing_url {
        Some(url) => Some(Arc::new(AddressingClient::new(url)?)),
        None => None,
    };

    let health = Health::new();
    let shutdown = CancellationToken::new();

    // Reconciliation core and its event channel
    let (events, event_rx) = event_channel();
    let reconciler = Reconciler::new(
        store.clone(),
        topology.clone(),
        inventory.clone(),
        device_creds.clone(),
        addressing,
    );
    tokio::spawn(reconciler.run(event_rx));

    // Switch supervisor, fed by topology change notifications
    let supervisor = SwitchSupervisor::new(
        topology.clone(),
        store.clone(),
        net_snmp_factory(),
        events.clone(),
        Duration::from_secs(args.scan_period_seconds),
        args.bypass_switch_init_failure,
    );
    let (refresh_tx, refresh_rx) = tokio::sync::mpsc::unbounded_channel();
    let notifier = TopologyNotifier::new();
    {
        let refresh_tx = refresh_tx.clone();
        notifier.on_change(move || {
            let _ = refresh_tx.send(());
        });
    }
    tokio::spawn(supervisor.clone().run(refresh_rx, shutdown.clone()));

    // Topology watchers
    tokio::spawn(watch_switches(
        topology.clone(),
        notifier,
        health.clone(),
        Duration::from_secs(args.topology_poll_seconds),
        shutdown.clone(),
    ));
    tokio::spawn(watch_management_nodes(
        topology.clone(),
        inventory.clone(),
        device_creds.clone(),
        cred_store.clone(),
        Duration::from_secs(args.topology_poll_seconds),
        shutdown.clone(),
    ));

    // Fabric switch BMCs are discovered directly over Redfish
    let nwp_settings = NetworkProtocolSettings::build(
        &args.syslog,
        &args.ntp,
        &args.fabric_ssh_key,
        &args.np_rf_url,
    )
    .context("bad network protocol target specification")?;
    let fabric = FabricDiscovery::new(
        topology.clone(),
        inventory.clone(),
        device_creds.clone(),
        cred_store.clone(),
        health.clone(),
        nwp_settings,
    )?;
    tokio::spawn(fabric.run(shutdown.clone()));

    // Inform ingestion from the notification daemon piped to stdin
    tokio::spawn(riverscout::snmp::inform::listen_stdin(shutdown.clone()));

    // Metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {e}");
        }
    });

    // Shutdown on SIGINT/SIGTERM
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Management API runs on the main task
    let ctx = Arc::new(ApiContext {
        cred_store,
        events,
        store,
        health,
    });
    http::run_server(&args.http_listen, ctx).await?;

    info!("riverscout shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
