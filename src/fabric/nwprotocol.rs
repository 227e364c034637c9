//! Redfish network-protocol configuration
//!
//! Newly surfaced fabric switch BMCs get their syslog forwarding, NTP
//! server, and SSH authorized keys pushed over Redfish: a PATCH of the
//! manager's NetworkProtocol resource, authenticated with the global
//! BMC credentials.

use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

/// Target specs arrive as `host[,host...]:port`.
fn split_target_spec(spec: &str) -> Result<(Vec<String>, u16)> {
    let (hosts, port) = spec.rsplit_once(':').ok_or_else(|| {
        Error::Config(format!(
            "can't split target specification '{spec}', incorrect format"
        ))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        Error::Config(format!(
            "can't convert port of target specification '{spec}', incorrect format"
        ))
    })?;
    let hosts = hosts.split(',').map(str::to_string).collect();
    Ok((hosts, port))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SyslogData {
    #[serde(rename = "ProtocolEnabled")]
    protocol_enabled: bool,
    #[serde(rename = "SyslogServers")]
    syslog_servers: Vec<String>,
    #[serde(rename = "Transport")]
    transport: String,
    #[serde(rename = "Port")]
    port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SshKeyData {
    #[serde(rename = "AuthorizedKeys")]
    authorized_keys: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct OemData {
    #[serde(rename = "Syslog", skip_serializing_if = "Option::is_none")]
    syslog: Option<SyslogData>,
    #[serde(rename = "SSHAdmin", skip_serializing_if = "Option::is_none")]
    ssh_admin: Option<SshKeyData>,
    #[serde(rename = "SSHConsole", skip_serializing_if = "Option::is_none")]
    ssh_console: Option<SshKeyData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NtpData {
    #[serde(rename = "NTPServers")]
    ntp_servers: Vec<String>,
    #[serde(rename = "ProtocolEnabled")]
    protocol_enabled: bool,
    #[serde(rename = "Port")]
    port: u16,
}

/// The NetworkProtocol payload PATCHed to every surfaced fabric BMC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkProtocolSettings {
    #[serde(rename = "Oem", skip_serializing_if = "Option::is_none")]
    oem: Option<OemData>,
    #[serde(rename = "NTP", skip_serializing_if = "Option::is_none")]
    ntp: Option<NtpData>,
    #[serde(skip)]
    redfish_path: String,
}

impl NetworkProtocolSettings {
    /// Builds the payload from the configured target specs. Returns
    /// `None` when nothing is configured, so callers can skip the PATCH
    /// entirely.
    pub fn build(
        syslog_spec: &str,
        ntp_spec: &str,
        ssh_key: &str,
        redfish_path: &str,
    ) -> Result<Option<Self>> {
        if syslog_spec.is_empty() && ntp_spec.is_empty() && ssh_key.is_empty() {
            return Ok(None);
        }

        let mut oem = OemData {
            syslog: None,
            ssh_admin: None,
            ssh_console: None,
        };

        if !syslog_spec.is_empty() {
            let (servers, port) = split_target_spec(syslog_spec)?;
            info!("Fabric BMC syslog forwarding target: {servers:?}:{port}");
            oem.syslog = Some(SyslogData {
                protocol_enabled: true,
                syslog_servers: servers,
                transport: "udp".to_string(),
                port,
            });
        }

        if !ssh_key.is_empty() {
            oem.ssh_admin = Some(SshKeyData {
                authorized_keys: ssh_key.to_string(),
            });
            oem.ssh_console = Some(SshKeyData {
                authorized_keys: ssh_key.to_string(),
            });
        }

        let ntp = if ntp_spec.is_empty() {
            None
        } else {
            let (servers, port) = split_target_spec(ntp_spec)?;
            info!("Fabric BMC NTP server: {servers:?}:{port}");
            Some(NtpData {
                ntp_servers: servers,
                protocol_enabled: true,
                port,
            })
        };

        let oem = if oem.syslog.is_none() && oem.ssh_admin.is_none() {
            None
        } else {
            Some(oem)
        };

        Ok(Some(Self {
            oem,
            ntp,
            redfish_path: redfish_path.to_string(),
        }))
    }

    /// PATCHes the settings to one BMC, authenticated with the given
    /// credentials. 200 and 204 both count as success.
    pub async fn apply(
        &self,
        client: &Client,
        address: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let url = format!("https://{address}{}", self.redfish_path);

        let resp = client
            .patch(&url)
            .basic_auth(username, Some(password))
            .json(self)
            .send()
            .await
            .map_err(|e| {
                Error::Internal(format!("error sending NTP/syslog info to '{address}': {e}"))
            })?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::NO_CONTENT {
            return Err(Error::UpstreamStatus {
                service: "fabric BMC",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        info!("Successfully sent syslog/NTP data to '{address}'");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
