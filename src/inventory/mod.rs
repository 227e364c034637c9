//! Inventory service client
//!
//! Registers discovered devices with the central inventory service and
//! queries what it currently records. Credentials never travel through
//! this client: registration carries blank credential fields so the
//! inventory service pulls them from the secret store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::ports::InventoryBoundary;
use crate::error::{Error, Result};

/// Retry count for REST calls
const REST_RETRY: u32 = 3;

/// Timeout for REST calls
const REST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Wire types
// =============================================================================

/// Payload for registering (or patching) a discovered endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FQDN", default)]
    pub fqdn: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "MACAddr", default)]
    pub mac_addr: String,
    #[serde(rename = "RediscoverOnUpdate", default)]
    pub rediscover_on_update: bool,
    #[serde(rename = "Enabled", skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl std::fmt::Display for EndpointRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let enabled = match self.enabled {
            Some(true) => "TRUE",
            Some(false) => "FALSE",
            None => "NIL",
        };
        write!(
            f,
            "ID: {}, FQDN: {}, IPAddress: {}, User: {}, Password: <REDACTED>, \
             MACAddr: {}, RediscoverOnUpdate: {}, Enabled: {}",
            self.id, self.fqdn, self.ip_address, self.user, self.mac_addr,
            self.rediscover_on_update, enabled
        )
    }
}

/// A component seeded directly into the inventory's component list,
/// bypassing normal discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Role")]
    pub role: String,
    #[serde(rename = "SubRole")]
    pub sub_role: String,
    #[serde(rename = "NID", skip_serializing_if = "Option::is_none")]
    pub nid: Option<i64>,
    #[serde(rename = "NetType")]
    pub net_type: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Class")]
    pub class: String,
}

#[derive(Debug, Clone, Serialize)]
struct ComponentNotification<'a> {
    #[serde(rename = "Components")]
    components: &'a [Component],
}

// =============================================================================
// Client
// =============================================================================

/// REST client for the inventory service (and the boot service it keeps
/// in sync after disable operations).
pub struct InventoryClient {
    client: Client,
    base_url: String,
    boot_url: String,
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64 << attempt.min(6))
}

impl InventoryClient {
    pub fn new(base_url: impl Into<String>, boot_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            boot_url: boot_url.into().trim_end_matches('/').to_string(),
        })
    }

    // Transport-level retry with bounded backoff. Status handling stays
    // with the caller.
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match req.try_clone() {
                // try_clone only fails for streaming bodies, which we never use
                None => return Ok(req.send().await?),
                Some(this_try) => match this_try.send().await {
                    Ok(resp) => return Ok(resp),
                    Err(e) if attempt + 1 < REST_RETRY => {
                        warn!("Inventory request failed (attempt {attempt}): {e}");
                        tokio::time::sleep(retry_delay(attempt)).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Registers a discovered endpoint. 201 means created; 409 means the
    /// endpoint already exists and is patched back to enabled instead.
    /// Returns true when the endpoint ends up registered and enabled.
    pub async fn register_endpoint(&self, payload: &EndpointRegistration) -> Result<bool> {
        let url = format!("{}/Inventory/RedfishEndpoints", self.base_url);
        debug!("POST to {url} with {payload}");

        let resp = self
            .execute(self.client.post(&url).json(payload))
            .await
            .map_err(|e| {
                warn!("Unable to send information for {}: {e}", payload.id);
                e
            })?;

        match resp.status() {
            StatusCode::CREATED => {
                info!("Successfully added {} to inventory", payload.id);
                Ok(true)
            }
            StatusCode::CONFLICT => {
                info!("{} already present; patching instead", payload.id);
                self.set_enabled(&payload.id, true).await
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                warn!(
                    "An error occurred uploading {}: {status} {body}; {} was not added",
                    payload.id, payload.id
                );
                Ok(false)
            }
        }
    }

    /// Enables or disables an endpoint. Rediscovery is requested only when
    /// enabling, so a disable never kicks off a discovery sweep.
    pub async fn set_enabled(&self, xname: &str, enabled: bool) -> Result<bool> {
        let payload = EndpointRegistration {
            id: xname.to_string(),
            enabled: Some(enabled),
            rediscover_on_update: enabled,
            ..Default::default()
        };

        let url = format!("{}/Inventory/RedfishEndpoints/{xname}", self.base_url);
        debug!("PATCH to {url}");

        let resp = self.execute(self.client.patch(&url).json(&payload)).await?;

        let status = resp.status();
        if status == StatusCode::OK {
            info!("Successfully patched {xname}");
            Ok(true)
        } else {
            let body = resp.text().await.unwrap_or_default();
            warn!("An error occurred patching {xname}: {status} {body}");
            Err(Error::UpstreamStatus {
                service: "inventory service",
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Fetches an endpoint's current record, or `None` if the endpoint is
    /// unknown to the inventory.
    pub async fn get_endpoint(&self, xname: &str) -> Result<Option<EndpointRegistration>> {
        let url = format!("{}/Inventory/RedfishEndpoints/{xname}", self.base_url);
        debug!("GET from {url}");

        let resp = self.execute(self.client.get(&url)).await?;

        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => {
                debug!("{xname} is not present in inventory");
                Ok(None)
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                warn!("Error occurred looking up {xname} in inventory (code {status}): {body}");
                Err(Error::UpstreamStatus {
                    service: "inventory service",
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    /// Returns the MAC address the inventory currently records for an
    /// endpoint, or `None` if the endpoint is unknown.
    pub async fn endpoint_mac(&self, xname: &str) -> Result<Option<String>> {
        Ok(self.get_endpoint(xname).await?.map(|ep| ep.mac_addr))
    }

    /// Whether an endpoint is present and enabled. A record with no
    /// enabled flag counts as present.
    pub async fn endpoint_present(&self, xname: &str) -> Result<bool> {
        match self.get_endpoint(xname).await? {
            Some(endpoint) => Ok(endpoint.enabled != Some(false)),
            None => Ok(false),
        }
    }

    /// Marks an endpoint as gone: disable it (never delete) and ask the
    /// boot service to resynchronize. Best-effort on both legs.
    pub async fn notify_removed(&self, xname: &str) {
        if let Err(e) = self.set_enabled(xname, false).await {
            warn!("Unable to disable {xname}: {e}");
        }
        if let Err(e) = self.request_boot_resync().await {
            warn!("Unable to request boot service resync: {e}");
        }
    }

    /// Asks the boot service to resynchronize its host list.
    pub async fn request_boot_resync(&self) -> Result<()> {
        let url = format!("{}/hosts", self.boot_url);
        debug!("POST to {url}");

        let resp = self.execute(self.client.post(&url)).await?;

        if resp.status() == StatusCode::NO_CONTENT {
            info!("Successfully forced boot service resync");
        } else {
            warn!(
                "An error occurred forcing boot service resync: {}",
                resp.status()
            );
        }
        Ok(())
    }

    /// Seeds a component directly into the inventory's component list,
    /// bypassing discovery. The inventory skips already existing
    /// components, so there is no conflict case to handle.
    pub async fn create_component(&self, component: Component) -> Result<()> {
        let id = component.id.clone();
        info!("Creating a component in inventory, {id}");

        let url = format!("{}/State/Components", self.base_url);
        let payload = ComponentNotification {
            components: std::slice::from_ref(&component),
        };
        debug!("POST to {url}");

        let resp = self.execute(self.client.post(&url).json(&payload)).await?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            info!("Successfully added {id} to inventory");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            warn!("An error occurred uploading {id}: {status} {body}; {id} was not added");
            Err(Error::UpstreamStatus {
                service: "inventory service",
                status: status.as_u16(),
                body,
            })
        }
    }

}

#[async_trait]
impl InventoryBoundary for InventoryClient {
    async fn notify_discovered(&self, xname: &str, mac: &str, ip_address: &str) -> Result<bool> {
        // Blank credential fields signal the inventory service to pull
        // from the secret store.
        let payload = EndpointRegistration {
            id: xname.to_string(),
            fqdn: xname.to_string(),
            ip_address: ip_address.to_string(),
            user: String::new(),
            password: String::new(),
            mac_addr: mac.to_string(),
            rediscover_on_update: true,
            enabled: None,
        };

        info!("Notifying inventory we discovered {xname}: BMC IP {ip_address}, BMC MAC: {mac}");
        self.register_endpoint(&payload).await
    }

    async fn recorded_mac(&self, xname: &str) -> Result<Option<String>> {
        self.endpoint_mac(xname).await
    }
}

// =============================================================================
// Tests
// =============================================================================
