//! DNS/DHCP boundary adapter
//!
//! Optional side notification fired when a device becomes ready, so the
//! address-management service can pin the device's name and lease. Purely
//! best-effort.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::domain::ports::AddressingNotifier;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct ReadyNotification<'a> {
    xname: &'a str,
    #[serde(rename = "macAddress")]
    mac_address: &'a str,
    #[serde(rename = "ipAddress")]
    ip_address: &'a str,
}

/// Posts device-ready notifications to a configured address-management URL.
pub struct AddressingClient {
    client: Client,
    url: String,
}

impl AddressingClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AddressingNotifier for AddressingClient {
    async fn notify_ready(&self, xname: &str, mac: &str, ip_address: &str) -> Result<()> {
        let payload = ReadyNotification {
            xname,
            mac_address: mac,
            ip_address,
        };
        debug!("POST to {} for {xname}", self.url);

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(Error::UpstreamStatus {
                service: "address management",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
