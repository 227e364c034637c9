//! seed-credentials - load default credential records into the secret store
//!
//! Install-time utility: takes the default BMC credential map (keyed by
//! vendor) and the default switch SNMP credentials as JSON and writes
//! them to the paths the discovery service reads from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use riverscout::credentials::{BmcCredentials, CredentialStore, SwitchCredentials};
use riverscout::secrets::VaultSecretStore;

/// Seed default credentials into the secret store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Default BMC credentials as JSON, keyed by vendor
    /// (e.g. {"Cray":{"username":"root","password":"..."}})
    #[arg(long, env = "BMC_DEFAULTS")]
    bmc_defaults: String,

    /// Default switch SNMP credentials as JSON
    #[arg(long, env = "SWITCH_DEFAULTS")]
    switch_defaults: String,

    /// Secret store mount point
    #[arg(long, env = "SECRETS_MOUNT", default_value = "secret")]
    secrets_mount: String,

    /// Root path for the service's credential records
    #[arg(long, env = "CREDS_BASE", default_value = "scout-creds")]
    creds_base: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let node_defaults: HashMap<String, BmcCredentials> =
        serde_json::from_str(&args.bmc_defaults)
            .context("unable to parse defaults for node BMCs")?;
    let switch_defaults: SwitchCredentials = serde_json::from_str(&args.switch_defaults)
        .context("unable to parse defaults for switches")?;

    info!("Connecting to secure store (Vault)...");
    let secrets = VaultSecretStore::from_env(&args.secrets_mount)
        .context("secure store connection failed")?;
    let cred_store = CredentialStore::new(args.creds_base, Arc::new(secrets));

    // The secret store is kind of a big deal, so wait forever for the
    // first write to go through.
    loop {
        match cred_store.store_default_credentials(&node_defaults).await {
            Ok(()) => break,
            Err(e) => {
                error!("Unable to reach secure store ({e})...trying again in 5 seconds");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
    info!("Stored default BMC credentials for {} vendors", node_defaults.len());

    cred_store
        .store_default_switch_credentials(&switch_defaults)
        .await
        .context("unable to store defaults for switches")?;
    info!("Stored default switch credentials");

    info!("Done.");
    Ok(())
}
