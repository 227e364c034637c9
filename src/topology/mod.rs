//! Topology Mapping Service
//!
//! Client for the system layout service: switch inventory, management-node
//! inventory, and switch-port-to-device identity resolution. Credential
//! placeholders in layout records (`vault://...`) are resolved through the
//! secret store, with defaults persisted back on first use.

pub mod watcher;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::credentials::{CredentialStore, DeviceCredStore};
use crate::domain::ports::PortResolver;
use crate::error::{Error, Result};

/// Prefix marking a credential field as a reference into the secret store.
pub const VAULT_URL_PREFIX: &str = "vault://";

const SEARCH_HARDWARE_ENDPOINT: &str = "search/hardware";

// =============================================================================
// Layout service records
// =============================================================================

/// A hardware record as returned by the layout service. The
/// `ExtraProperties` bag varies by hardware type and stays untyped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareRecord {
    #[serde(rename = "Parent", default)]
    pub parent: String,
    #[serde(rename = "Children", default)]
    pub children: Vec<String>,
    #[serde(rename = "Xname", default)]
    pub xname: String,
    #[serde(rename = "Type", default)]
    pub hw_type: String,
    #[serde(rename = "Class", default)]
    pub class: String,
    #[serde(rename = "TypeString", default)]
    pub type_string: String,
    #[serde(rename = "ExtraProperties", default)]
    pub extra_properties: Value,
}

impl HardwareRecord {
    /// Fetch a string field out of the extra-properties bag.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra_properties.get(key).and_then(Value::as_str)
    }

    /// Fetch a numeric field out of the extra-properties bag.
    pub fn extra_number(&self, key: &str) -> Option<i64> {
        let value = self.extra_properties.get(key)?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }
}

/// One management switch from the layout service, with resolved SNMP
/// credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Switch {
    pub id: String,
    pub address: String,
    pub snmp_user: String,
    pub snmp_auth_password: String,
    pub snmp_auth_protocol: String,
    pub snmp_priv_password: String,
    pub snmp_priv_protocol: String,
    pub model: String,
}

impl std::fmt::Display for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ Xname: {}, Model: {}, Address: {}, SNMP User: {}, \
             SNMP Auth Password: <REDACTED>, SNMP Auth Protocol: {}, \
             SNMP Priv Password: <REDACTED>, SNMP Priv Protocol: {} }}",
            self.id,
            self.model,
            self.address,
            self.snmp_user,
            self.snmp_auth_protocol,
            self.snmp_priv_protocol
        )
    }
}

/// One port on a management switch and the BMC it connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPort {
    pub id: usize,
    pub if_name: String,
    pub peer_id: String,
}

// =============================================================================
// xname helpers
// =============================================================================

/// Whether an xname names a node BMC (`x<cab>c<chassis>s<slot>b<bmc>`).
pub fn is_node_bmc(xname: &str) -> bool {
    fn digits(rest: &str) -> Option<(&str, &str)> {
        let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        Some((&rest[..end], &rest[end..]))
    }

    let Some(rest) = xname.strip_prefix('x') else {
        return false;
    };
    let Some((_, rest)) = digits(rest) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('c') else {
        return false;
    };
    let Some((_, rest)) = digits(rest) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('s') else {
        return false;
    };
    let Some((_, rest)) = digits(rest) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('b') else {
        return false;
    };
    matches!(digits(rest), Some((_, "")))
}

/// Normalizes a role string to its canonical capitalization, or `None`
/// when the value is not a recognized role.
pub fn normalize_role(role: &str) -> Option<&'static str> {
    match role.to_ascii_lowercase().as_str() {
        "compute" => Some("Compute"),
        "service" => Some("Service"),
        "system" => Some("System"),
        "application" => Some("Application"),
        "storage" => Some("Storage"),
        "management" => Some("Management"),
        _ => None,
    }
}

/// Normalizes a subrole string, or `None` when unrecognized.
pub fn normalize_subrole(subrole: &str) -> Option<&'static str> {
    match subrole.to_ascii_lowercase().as_str() {
        "master" => Some("Master"),
        "worker" => Some("Worker"),
        "storage" => Some("Storage"),
        _ => None,
    }
}

// =============================================================================
// Topology client
// =============================================================================

/// Client for the layout service plus the credential stores used to
/// resolve `vault://` references.
pub struct TopologyClient {
    client: Client,
    base_url: String,
    device_creds: DeviceCredStore,
    cred_store: CredentialStore,
}

impl TopologyClient {
    pub fn new(
        base_url: impl Into<String>,
        device_creds: DeviceCredStore,
        cred_store: CredentialStore,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_creds,
            cred_store,
        })
    }

    async fn get_records(&self, url: String, query: &[(&str, &str)]) -> Result<Vec<HardwareRecord>> {
        trace!("GET from {url}");
        let resp = self.client.get(&url).query(query).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Invalid response from layout service. Code: {status}, message: {body}");
            return Err(Error::UpstreamStatus {
                service: "layout service",
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }

    /// Builds a [`Switch`] from a layout record, resolving `vault://`
    /// credential references through the secret store. Newly established
    /// credentials are persisted back so later polls find them.
    async fn switch_from_record(&self, record: &HardwareRecord) -> Result<Switch> {
        let ip6 = record.extra_str("IP6addr").unwrap_or_default();
        let ip4 = record.extra_str("IP4addr").unwrap_or_default();
        let address = if !ip6.is_empty() && !ip6.eq_ignore_ascii_case("dhcpv6") {
            ip6.to_string()
        } else if !ip4.is_empty() && !ip4.eq_ignore_ascii_case("dhcp") {
            ip4.to_string()
        } else {
            info!(
                "No IP found for {} in layout service, falling back to using DNS/hosts file",
                record.xname
            );
            record.xname.clone()
        };

        let snmp_user = record.extra_str("SNMPUsername").unwrap_or_default().to_string();
        let snmp_auth_pw = record.extra_str("SNMPAuthPassword").unwrap_or_default().to_string();
        let snmp_priv_pw = record.extra_str("SNMPPrivPassword").unwrap_or_default().to_string();

        let mut switch = Switch {
            id: record.xname.clone(),
            address,
            snmp_user: snmp_user.clone(),
            snmp_auth_password: snmp_auth_pw.clone(),
            snmp_auth_protocol: record
                .extra_str("SNMPAuthProtocol")
                .unwrap_or_default()
                .to_string(),
            snmp_priv_password: snmp_priv_pw.clone(),
            snmp_priv_protocol: record
                .extra_str("SNMPPrivProtocol")
                .unwrap_or_default()
                .to_string(),
            model: record.extra_str("Model").unwrap_or_default().to_string(),
        };

        let mut stored = self.device_creds.get(&record.xname).await.map_err(|e| {
            warn!("Unable to retrieve key {} from secret store: {e}", record.xname);
            e
        })?;

        // Nothing stored yet for this switch: establish a record from the
        // layout-provided values, falling back to the configured defaults,
        // and persist it.
        if stored.snmp_auth_pass.is_empty()
            || stored.snmp_priv_pass.is_empty()
            || stored.username.is_empty()
        {
            match self.cred_store.get_default_switch_credentials().await {
                Err(e) => warn!("Unable to get default switch credentials: {e}"),
                Ok(None) => warn!("Unable to get default switch credentials: none stored"),
                Ok(Some(defaults)) => {
                    stored.xname = record.xname.clone();

                    if !snmp_auth_pw.is_empty() && !snmp_auth_pw.starts_with(VAULT_URL_PREFIX) {
                        stored.snmp_auth_pass = snmp_auth_pw;
                    } else {
                        stored.snmp_auth_pass = defaults.snmp_auth_password;
                    }

                    if !snmp_priv_pw.is_empty() && !snmp_priv_pw.starts_with(VAULT_URL_PREFIX) {
                        stored.snmp_priv_pass = snmp_priv_pw;
                    } else {
                        stored.snmp_priv_pass = defaults.snmp_priv_password;
                    }

                    if !snmp_user.is_empty() {
                        stored.username = snmp_user;
                    } else {
                        stored.username = defaults.snmp_username;
                        switch.snmp_user = stored.username.clone();
                    }

                    match self.device_creds.put(&stored).await {
                        Err(e) => warn!("Unable to store credentials for switch: {e}"),
                        Ok(()) => info!("Stored credential for {}", stored.xname),
                    }
                }
            }
        }

        if switch.snmp_auth_password.starts_with(VAULT_URL_PREFIX) {
            switch.snmp_auth_password = stored.snmp_auth_pass;
        }
        if switch.snmp_priv_password.starts_with(VAULT_URL_PREFIX) {
            switch.snmp_priv_password = stored.snmp_priv_pass;
        }

        Ok(switch)
    }

    /// Queries the full current set of river-class management switches.
    pub async fn get_switches(&self) -> Result<HashMap<String, Switch>> {
        let records = self
            .get_records(
                format!("{}/{}", self.base_url, SEARCH_HARDWARE_ENDPOINT),
                &[("type", "comptype_mgmt_switch"), ("class", "River")],
            )
            .await?;

        let mut ret = HashMap::new();
        for record in &records {
            let switch = self.switch_from_record(record).await?;
            ret.insert(record.xname.clone(), switch);
        }
        Ok(ret)
    }

    /// Fetches a single switch record by xname.
    pub async fn get_switch_by_name(&self, switch_name: &str) -> Result<Switch> {
        let url = format!("{}/hardware/{switch_name}", self.base_url);
        trace!("GET from {url}");
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Invalid response from layout service. Code: {status}, message: {body}");
            return Err(Error::UpstreamStatus {
                service: "layout service",
                status: status.as_u16(),
                body,
            });
        }

        let record: HardwareRecord = resp.json().await?;
        self.switch_from_record(&record).await
    }

    /// Enumerates a switch's connectors as ports with BMC peers. Ports
    /// whose peer list carries no BMC are dropped.
    pub async fn get_switch_ports(&self, switch_name: &str) -> Result<Vec<SwitchPort>> {
        let records = self
            .get_records(
                format!("{}/{}", self.base_url, SEARCH_HARDWARE_ENDPOINT),
                &[
                    ("parent", switch_name),
                    ("type", "comptype_mgmt_switch_connector"),
                ],
            )
            .await?;

        let mut ports = Vec::new();
        for (i, child) in records.iter().enumerate() {
            debug!("ExtraProperties are: {}", child.extra_properties);
            let if_name = child.extra_str("VendorName").unwrap_or_default().to_string();

            let peer_id = child
                .extra_properties
                .get("NodeNics")
                .and_then(Value::as_array)
                .and_then(|nics| {
                    nics.iter()
                        .filter_map(Value::as_str)
                        .find(|peer| is_node_bmc(peer))
                })
                .unwrap_or_default()
                .to_string();

            if !peer_id.is_empty() {
                ports.push(SwitchPort {
                    id: i,
                    if_name,
                    peer_id,
                });
            }
        }
        Ok(ports)
    }

    /// Finds the port on `switch_name` whose interface name is `port`.
    pub async fn get_switch_port_by_if_name(
        &self,
        switch_name: &str,
        port: &str,
    ) -> Result<SwitchPort> {
        let ports = self.get_switch_ports(switch_name).await?;
        ports
            .into_iter()
            .find(|item| item.if_name == port)
            .ok_or_else(|| Error::NotFound(format!("no port {port} on switch {switch_name}")))
    }

    /// Translates a (switch, port) attachment to the xname of the device
    /// on the other end.
    pub async fn switch_port_to_xname(&self, switch_name: &str, port: &str) -> Result<String> {
        let port = self.get_switch_port_by_if_name(switch_name, port).await?;
        Ok(port.peer_id)
    }

    /// Queries the fabric switch BMC inventory. Fabric switches carry a
    /// Redfish endpoint of their own and no switch-port discovery path,
    /// so they are watched directly rather than learned over SNMP.
    pub async fn get_router_bmcs(&self) -> Result<Vec<HardwareRecord>> {
        self.get_records(
            format!("{}/{}", self.base_url, SEARCH_HARDWARE_ENDPOINT),
            &[("type", "comptype_rtr_bmc")],
        )
        .await
    }

    /// Queries the river-class management-role node inventory.
    pub async fn get_management_nodes(&self) -> Result<Vec<HardwareRecord>> {
        self.get_records(
            format!("{}/{}", self.base_url, SEARCH_HARDWARE_ENDPOINT),
            &[
                ("type", "comptype_node"),
                ("class", "River"),
                ("extra_properties.Role", "Management"),
            ],
        )
        .await
    }

    /// Queries the connectors whose peer list names the given BMC.
    pub async fn get_connectors_by_bmc(&self, xname: &str) -> Result<Vec<HardwareRecord>> {
        self.get_records(
            format!("{}/{}", self.base_url, SEARCH_HARDWARE_ENDPOINT),
            &[("node_nics", xname)],
        )
        .await
    }
}

#[async_trait]
impl PortResolver for TopologyClient {
    async fn resolve(&self, switch_name: &str, port: &str) -> Result<String> {
        self.switch_port_to_xname(switch_name, port).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_node_bmc() {
        assert!(is_node_bmc("x3000c0s28b0"));
        assert!(is_node_bmc("x0c0s1b1"));
        assert!(!is_node_bmc("x3000c0w14"));
        assert!(!is_node_bmc("x3000c0s28"));
        assert!(!is_node_bmc("x3000c0s28b0n0"));
        assert!(!is_node_bmc("c0s28b0"));
        assert!(!is_node_bmc(""));
    }

    #[test]
    fn test_normalize_role() {
        assert_eq!(normalize_role("management"), Some("Management"));
        assert_eq!(normalize_role("Management"), Some("Management"));
        assert_eq!(normalize_role("COMPUTE"), Some("Compute"));
        assert_eq!(normalize_role("janitor"), None);

        assert_eq!(normalize_subrole("master"), Some("Master"));
        assert_eq!(normalize_subrole("intern"), None);
    }

    #[test]
    fn test_hardware_record_extra_properties() {
        let record = HardwareRecord {
            xname: "x3000c0w14".to_string(),
            extra_properties: json!({
                "IP4addr": "10.254.0.2",
                "Model": "S3048-ON",
                "NID": 100001.0,
            }),
            ..Default::default()
        };

        assert_eq!(record.extra_str("IP4addr"), Some("10.254.0.2"));
        assert_eq!(record.extra_str("Model"), Some("S3048-ON"));
        assert_eq!(record.extra_str("Missing"), None);
        assert_eq!(record.extra_number("NID"), Some(100001));
    }

    #[test]
    fn test_switch_display_redacts_passwords() {
        let switch = Switch {
            id: "x3000c0w14".to_string(),
            snmp_auth_password: "authpw".to_string(),
            snmp_priv_password: "privpw".to_string(),
            ..Default::default()
        };
        let rendered = switch.to_string();
        assert!(!rendered.contains("authpw"));
        assert!(!rendered.contains("privpw"));
    }

    #[test]
    fn test_hardware_record_decodes_layout_payload() {
        let body = json!([{
            "Parent": "x3000",
            "Xname": "x3000c0w14",
            "Type": "comptype_mgmt_switch",
            "Class": "River",
            "TypeString": "MgmtSwitch",
            "ExtraProperties": {
                "IP6addr": "DHCPv6",
                "IP4addr": "10.254.0.2",
                "SNMPUsername": "scanner",
                "SNMPAuthPassword": "vault://secret/x3000c0w14",
                "SNMPAuthProtocol": "MD5",
                "SNMPPrivPassword": "vault://secret/x3000c0w14",
                "SNMPPrivProtocol": "DES",
                "Model": "S3048-ON"
            }
        }]);

        let records: Vec<HardwareRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].xname, "x3000c0w14");
        assert_eq!(records[0].extra_str("SNMPUsername"), Some("scanner"));
    }
}
